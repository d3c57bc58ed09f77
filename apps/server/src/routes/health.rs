use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(call_health))
        .route("/call-health", get(call_health))
        .route("/chat-health", get(chat_health))
        .route("/webrtc-health", get(webrtc_health))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    protocol: &'static str,
    active_appointments: usize,
    total_connections: usize,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    service: Value,
}

fn health(state: &AppState, service: Value) -> Json<HealthBody> {
    let snapshot = state.registry.snapshot();
    Json(HealthBody {
        status: "healthy",
        protocol: "http",
        active_appointments: snapshot.active_sessions,
        total_connections: snapshot.total_connections,
        timestamp: Utc::now(),
        service,
    })
}

fn endpoint(state: &AppState, path: &str) -> String {
    format!("{}/{path}", state.config.public_ws_url.trim_end_matches('/'))
}

async fn call_health(State(state): State<AppState>) -> Json<HealthBody> {
    let service = json!({
        "service": "call-signaling",
        "endpoint": endpoint(&state, "call-signaling"),
        "activeCalls": state.calls.in_progress(),
    });
    health(&state, service)
}

async fn chat_health(State(state): State<AppState>) -> Json<HealthBody> {
    let service = json!({
        "service": "chat-signaling",
        "endpoint": endpoint(&state, "chat-signaling"),
    });
    health(&state, service)
}

async fn webrtc_health(State(state): State<AppState>) -> Json<HealthBody> {
    let service = json!({
        "services": {
            "call": endpoint(&state, "call-signaling"),
            "audio": endpoint(&state, "audio-signaling"),
            "chat": endpoint(&state, "chat-signaling"),
        },
        "activeCalls": state.calls.in_progress(),
    });
    health(&state, service)
}
