use chrono::Utc;
use serde_json::Value;
use shared_proto::signaling::{
    ClientEnvelope, ErrorCode, MessageId, Payload, RelayedEnvelope, ServerEnvelope, SignalKind,
};

use crate::bridge::messages_after;
use crate::calls::CallTracker;
use crate::connection::Connection;
use crate::error::BridgeError;
use crate::models::SessionRef;
use crate::registry::ConnectionRegistry;
use crate::state::AppState;

/// What happened to one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Forwarded to this many other members.
    Relayed(usize),
    /// Duplicate offer, dropped.
    Suppressed,
    /// Delivered to this many members, sender included.
    Broadcast(usize),
    Replied,
    Failed,
}

pub async fn route_text(state: &AppState, connection: &mut Connection, text: &str) -> RouteOutcome {
    match ClientEnvelope::parse(text) {
        Ok(envelope) => route(state, connection, envelope).await,
        Err(e) => {
            reject(connection, &e.to_string());
            RouteOutcome::Failed
        }
    }
}

/// Reports a malformed envelope to its sender only. The connection stays open.
pub fn reject(connection: &Connection, detail: &str) {
    tracing::warn!(
        session_id = %connection.session_id,
        user_id = %connection.user_id,
        detail,
        "rejected malformed envelope"
    );
    connection.reply(&ServerEnvelope::error(
        ErrorCode::InvalidEnvelope,
        "Invalid message format",
        Some(detail.to_string()),
    ));
}

pub async fn route(
    state: &AppState,
    connection: &mut Connection,
    envelope: ClientEnvelope,
) -> RouteOutcome {
    tracing::debug!(
        session_id = %connection.session_id,
        user_id = %connection.user_id,
        message_type = envelope.kind(),
        "routing envelope"
    );

    match envelope {
        ClientEnvelope::Offer(payload) => relay_offer(state, connection, payload),
        ClientEnvelope::Signal { kind, payload } => {
            track_signal(&state.calls, &connection.session_id, kind);
            relay(&state.registry, connection, kind.as_str(), payload)
        }
        ClientEnvelope::Presence { kind, mut payload } => {
            payload
                .entry("senderId")
                .or_insert_with(|| Value::String(connection.user_id.clone()));
            relay(&state.registry, connection, kind.as_str(), payload)
        }
        ClientEnvelope::ChatMessage(draft) => persist_chat(state, connection, draft).await,
        ClientEnvelope::SessionStatusRequest => session_status(state, connection).await,
        ClientEnvelope::SessionEndRequest { reason } => end_session(state, connection, reason).await,
        ClientEnvelope::SyncMessages { last_message_id } => {
            sync_messages(state, connection, last_message_id).await
        }
        ClientEnvelope::ResendOfferRequest => {
            let delivered = state.registry.broadcast_all(
                &connection.session_id,
                &ServerEnvelope::ResendOfferRequest {
                    session_id: connection.session_id.clone(),
                    user_id: connection.user_id.clone(),
                    timestamp: Utc::now(),
                },
            );
            RouteOutcome::Broadcast(delivered)
        }
        ClientEnvelope::Unknown { kind, payload } => {
            tracing::debug!(
                session_id = %connection.session_id,
                message_type = %kind,
                "relaying unrecognized envelope type"
            );
            relay(&state.registry, connection, &kind, payload)
        }
    }
}

fn relay(
    registry: &ConnectionRegistry,
    connection: &Connection,
    kind: &str,
    payload: Payload,
) -> RouteOutcome {
    let envelope = RelayedEnvelope::new(kind, payload, &connection.session_id, &connection.user_id);
    RouteOutcome::Relayed(registry.broadcast(
        &connection.session_id,
        &envelope,
        Some(connection.id),
    ))
}

fn relay_offer(state: &AppState, connection: &Connection, payload: Payload) -> RouteOutcome {
    if !state
        .offers
        .should_process(&connection.session_id, &connection.user_id, &payload)
    {
        return RouteOutcome::Suppressed;
    }

    if connection.kind.is_call()
        && state
            .calls
            .begin_ringing(&connection.session_id, &connection.user_id)
    {
        tracing::info!(
            session_id = %connection.session_id,
            caller_id = %connection.user_id,
            "call ringing"
        );
        if let Some(ring_timeout) = state.config.ring_timeout {
            let timer = tokio::spawn(expire_ringing_call(
                state.clone(),
                connection.session_id.clone(),
                connection.user_id.clone(),
                ring_timeout,
            ));
            state
                .calls
                .arm_ring_timer(&connection.session_id, timer.abort_handle());
        }
    }

    relay(&state.registry, connection, "offer", payload)
}

async fn expire_ringing_call(
    state: AppState,
    session_id: String,
    caller_id: String,
    after: std::time::Duration,
) {
    tokio::time::sleep(after).await;
    if !state.calls.expire_ringing(&session_id, &caller_id) {
        return;
    }

    let delivered = state.registry.broadcast_all(
        &session_id,
        &ServerEnvelope::CallTimeout {
            session_id: session_id.clone(),
            user_id: caller_id.clone(),
            timestamp: Utc::now(),
        },
    );
    tracing::info!(%session_id, %caller_id, delivered, "unanswered call timed out");
}

fn track_signal(calls: &CallTracker, session_id: &str, kind: SignalKind) {
    match kind {
        SignalKind::Answer | SignalKind::CallAnswered => {
            calls.mark_answered(session_id);
        }
        SignalKind::CallRejected | SignalKind::CallTimeout | SignalKind::CallEnded => {
            calls.end(session_id);
        }
        SignalKind::IceCandidate => {}
    }
}

async fn persist_chat(state: &AppState, connection: &Connection, draft: Payload) -> RouteOutcome {
    let result = state
        .backend
        .persist_chat_message(
            &connection.session_id,
            connection.auth_token.as_deref(),
            &draft,
        )
        .await;

    match result {
        Ok(message) => {
            let delivered = state.registry.broadcast_all(
                &connection.session_id,
                &ServerEnvelope::ChatMessage {
                    session_id: connection.session_id.clone(),
                    message,
                    timestamp: Utc::now(),
                },
            );
            RouteOutcome::Broadcast(delivered)
        }
        Err(e) => backend_failure(connection, "Failed to send message", e),
    }
}

async fn session_status(state: &AppState, connection: &Connection) -> RouteOutcome {
    let result = state
        .backend
        .get_session_status(&connection.session_id, connection.auth_token.as_deref())
        .await;

    match result {
        Ok(session_data) => {
            connection.reply(&ServerEnvelope::SessionStatusResponse {
                session_id: connection.session_id.clone(),
                session_data,
                timestamp: Utc::now(),
            });
            RouteOutcome::Replied
        }
        Err(e) => backend_failure(connection, "Failed to get session status", e),
    }
}

async fn end_session(
    state: &AppState,
    connection: &Connection,
    reason: Option<String>,
) -> RouteOutcome {
    let reason = reason.unwrap_or_else(|| {
        SessionRef::classify(&connection.session_id)
            .default_end_reason()
            .to_string()
    });
    let result = state
        .backend
        .end_session(
            &connection.session_id,
            connection.auth_token.as_deref(),
            &reason,
        )
        .await;

    match result {
        Ok(_) => {
            state.calls.end(&connection.session_id);
            let ended_at = Utc::now();
            connection.reply(&ServerEnvelope::SessionEndSuccess {
                session_id: connection.session_id.clone(),
                reason: reason.clone(),
                ended_at,
            });
            let delivered = state.registry.broadcast_all(
                &connection.session_id,
                &ServerEnvelope::SessionEnded {
                    session_id: connection.session_id.clone(),
                    reason,
                    ended_at,
                },
            );
            tracing::info!(
                session_id = %connection.session_id,
                ended_by = %connection.user_id,
                delivered,
                "session ended"
            );
            RouteOutcome::Broadcast(delivered)
        }
        Err(BridgeError::Rejected(message)) => {
            tracing::warn!(
                session_id = %connection.session_id,
                user_id = %connection.user_id,
                %message,
                "backend refused to end session"
            );
            connection.reply(&ServerEnvelope::SessionEndError {
                session_id: connection.session_id.clone(),
                message,
                timestamp: Utc::now(),
            });
            RouteOutcome::Failed
        }
        Err(e) => backend_failure(connection, "Failed to end session", e),
    }
}

async fn sync_messages(
    state: &AppState,
    connection: &mut Connection,
    requested: Option<MessageId>,
) -> RouteOutcome {
    let cursor = requested.or(connection.last_synced_message_id);
    let result = state
        .backend
        .fetch_messages_since(
            &connection.session_id,
            connection.auth_token.as_deref(),
            cursor,
        )
        .await;

    match result {
        Ok(messages) => {
            let (messages, last) = messages_after(messages, cursor);
            tracing::debug!(
                session_id = %connection.session_id,
                user_id = %connection.user_id,
                cursor = ?cursor,
                count = messages.len(),
                "messages synced"
            );
            connection.reply(&ServerEnvelope::MessagesSynced {
                session_id: connection.session_id.clone(),
                messages,
                timestamp: Utc::now(),
            });
            if let Some(last) = last {
                connection.advance_cursor(last);
            }
            RouteOutcome::Replied
        }
        Err(e) => backend_failure(connection, "Failed to sync messages", e),
    }
}

fn backend_failure(connection: &Connection, message: &str, error: BridgeError) -> RouteOutcome {
    tracing::warn!(
        session_id = %connection.session_id,
        user_id = %connection.user_id,
        error = %error,
        "{message}"
    );
    connection.reply(&ServerEnvelope::error(
        ErrorCode::Backend,
        message,
        Some(error.to_string()),
    ));
    RouteOutcome::Failed
}
