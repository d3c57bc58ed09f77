use serde::{Deserialize, Serialize};

/// Response wrapper used by every session backend endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEnvelope<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct EndSessionRequest<'a> {
    pub reason: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinceQuery {
    pub since: u64,
}

/// How a session id maps onto the backend's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRef<'a> {
    /// `text_session_{id}` sessions live under `/api/text-sessions/{id}`.
    TextSession(&'a str),
    Appointment(&'a str),
}

impl<'a> SessionRef<'a> {
    pub fn classify(session_id: &'a str) -> Self {
        match session_id.strip_prefix("text_session_") {
            Some(id) if !id.is_empty() => SessionRef::TextSession(id),
            _ => SessionRef::Appointment(session_id),
        }
    }

    pub fn default_end_reason(self) -> &'static str {
        match self {
            SessionRef::TextSession(_) => "General Checkup",
            SessionRef::Appointment(_) => "manual_end",
        }
    }
}
