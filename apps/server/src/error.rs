use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Why a connection was refused before it was opened.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Appointment ID required")]
    MissingSessionId,
    #[error("User ID required")]
    MissingUserId,
    #[error("Invalid handshake: {0}")]
    Invalid(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Failures talking to the session backend. Never retried by the relay.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("session backend timed out")]
    Timeout,
    #[error("session backend unreachable: {0}")]
    Network(String),
    #[error("session backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("session backend rejected the request: {0}")]
    Rejected(String),
    #[error("invalid session backend response: {0}")]
    InvalidResponse(String),
    #[error("invalid session backend url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for BridgeError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            BridgeError::Timeout
        } else if value.is_decode() {
            BridgeError::InvalidResponse(value.to_string())
        } else {
            BridgeError::Network(value.to_string())
        }
    }
}
