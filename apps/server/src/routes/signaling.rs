use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use shared_proto::ConnectionKind;

use crate::connection::{self, Handshake, HandshakeParams};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/call-signaling", get(call_signaling))
        .route("/call-signaling/:session_id", get(call_signaling))
        .route("/audio-signaling", get(legacy_call_signaling))
        .route("/audio-signaling/:session_id", get(legacy_call_signaling))
        .route("/chat-signaling", get(chat_signaling))
        .route("/chat-signaling/:session_id", get(chat_signaling))
}

async fn call_signaling(
    State(state): State<AppState>,
    path: Option<Path<String>>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ConnectionKind::Call, path, params, ws)
}

async fn legacy_call_signaling(
    State(state): State<AppState>,
    path: Option<Path<String>>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ConnectionKind::LegacyCall, path, params, ws)
}

async fn chat_signaling(
    State(state): State<AppState>,
    path: Option<Path<String>>,
    Query(params): Query<HandshakeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ConnectionKind::Chat, path, params, ws)
}

fn upgrade(
    state: AppState,
    kind: ConnectionKind,
    path: Option<Path<String>>,
    params: HandshakeParams,
    ws: WebSocketUpgrade,
) -> Response {
    if state.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Server shutting down" })),
        )
            .into_response();
    }

    let handshake = match Handshake::resolve(
        kind,
        params,
        path.map(|Path(session_id)| session_id),
        state.config.backend_service_token.as_deref(),
    ) {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "refusing websocket handshake");
            return e.into_response();
        }
    };

    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| connection::run(socket, handshake, state))
}
