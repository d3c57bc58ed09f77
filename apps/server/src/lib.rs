//! WebSocket signaling relay: fans call-setup and chat envelopes out to the
//! members of a session and bridges chat/session lifecycle to the REST backend.

pub mod bridge;
pub mod calls;
pub mod config;
pub mod connection;
pub mod dedupe;
pub mod error;
pub mod models;
pub mod observability;
pub mod registry;
pub mod router;
pub mod routes;
pub mod state;
pub mod validation;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::signaling::router())
        .merge(routes::health::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
