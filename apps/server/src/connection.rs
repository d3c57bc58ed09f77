use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use shared_proto::signaling::{MessageId, ServerEnvelope};
use shared_proto::ConnectionKind;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use validator::Validate;

use crate::error::HandshakeError;
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::router;
use crate::state::AppState;
use crate::validation::{normalize_param, validate_identifier};

/// Raw handshake parameters from the upgrade request's query string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub appointment_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Validate)]
pub struct Handshake {
    #[validate(length(min = 1, max = 128), custom(function = "validate_identifier"))]
    pub session_id: String,
    #[validate(length(min = 1, max = 128), custom(function = "validate_identifier"))]
    pub user_id: String,
    pub auth_token: Option<String>,
    pub kind: ConnectionKind,
}

impl Handshake {
    /// Query ids win over the path suffix. Missing session or user id is fatal.
    pub fn resolve(
        kind: ConnectionKind,
        params: HandshakeParams,
        path_session_id: Option<String>,
        fallback_token: Option<&str>,
    ) -> Result<Self, HandshakeError> {
        let session_id = normalize_param(params.appointment_id)
            .or_else(|| normalize_param(params.session_id))
            .or_else(|| normalize_param(path_session_id))
            .ok_or(HandshakeError::MissingSessionId)?;
        let user_id = normalize_param(params.user_id).ok_or(HandshakeError::MissingUserId)?;
        let auth_token =
            normalize_param(params.auth_token).or_else(|| fallback_token.map(str::to_string));

        let handshake = Self {
            session_id,
            user_id,
            auth_token,
            kind,
        };
        handshake
            .validate()
            .map_err(|e| HandshakeError::Invalid(e.to_string()))?;
        Ok(handshake)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Closing,
    Closed,
}

fn advance(phase: &mut Phase, next: Phase) {
    tracing::debug!(from = ?*phase, to = ?next, "connection phase");
    *phase = next;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    TransportError,
    HeartbeatTimeout,
    /// The peer stopped reading and a write could not complete in time.
    WriteStalled,
    WriterClosed,
    ServerShutdown,
}

/// A live, handshaken connection as seen by the router.
///
/// Owned by the connection's dispatcher task, so the sync cursor needs no lock.
pub struct Connection {
    pub id: ConnectionId,
    pub session_id: String,
    pub user_id: String,
    pub auth_token: Option<String>,
    pub kind: ConnectionKind,
    pub last_synced_message_id: Option<MessageId>,
    outbound: ConnectionHandle,
}

impl Connection {
    pub fn new(handshake: Handshake, outbound: ConnectionHandle) -> Self {
        Self {
            id: outbound.id,
            session_id: handshake.session_id,
            user_id: handshake.user_id,
            auth_token: handshake.auth_token,
            kind: handshake.kind,
            last_synced_message_id: None,
            outbound,
        }
    }

    /// Sends to this connection only. A closed connection drops the reply.
    pub fn reply(&self, envelope: &ServerEnvelope) -> bool {
        let sent = self.outbound.send(envelope);
        if !sent {
            tracing::debug!(
                session_id = %self.session_id,
                connection_id = %self.id,
                "reply dropped, connection already closed"
            );
        }
        sent
    }

    /// The cursor only moves forward.
    pub fn advance_cursor(&mut self, id: MessageId) {
        if self.last_synced_message_id.map_or(true, |current| id > current) {
            self.last_synced_message_id = Some(id);
        }
    }
}

/// Lock-free "last heard from the peer" clock.
struct Liveness {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last_seen)
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    grace: Duration,
}

enum Inbound {
    Text(String),
    Undecodable,
}

pub async fn run(socket: WebSocket, handshake: Handshake, state: AppState) {
    let span = tracing::info_span!(
        "connection",
        session_id = %handshake.session_id,
        user_id = %handshake.user_id,
        kind = handshake.kind.as_str(),
    );
    serve(socket, handshake, state).instrument(span).await
}

async fn serve(socket: WebSocket, handshake: Handshake, state: AppState) {
    let mut phase = Phase::Connecting;
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let handle = ConnectionHandle::new(handshake.user_id.clone(), handshake.kind, tx);
    let connection = Connection::new(handshake, handle.clone());
    let connection_id = connection.id;
    let session_id = connection.session_id.clone();
    let user_id = connection.user_id.clone();
    let mut shutdown = state.shutdown_signal();

    let members = state.registry.register(&session_id, handle.clone());
    advance(&mut phase, Phase::Open);
    tracing::info!(
        %connection_id,
        members,
        has_auth_token = connection.auth_token.is_some(),
        "connection registered"
    );
    handle.send(&ServerEnvelope::ConnectionEstablished {
        session_id: session_id.clone(),
        user_id: user_id.clone(),
        connection_kind: connection.kind,
        timestamp: Utc::now(),
    });

    let liveness = Arc::new(Liveness::new());
    let heartbeat = Heartbeat {
        interval: state.config.heartbeat_interval,
        grace: state.config.pong_timeout,
    };
    let (dead_tx, mut dead_rx) = oneshot::channel::<CloseReason>();
    tokio::spawn(write_loop(sink, rx, heartbeat, liveness.clone(), dead_tx).in_current_span());

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let dispatcher =
        tokio::spawn(dispatch_loop(state.clone(), connection, inbound_rx).in_current_span());

    let reason = loop {
        tokio::select! {
            frame = stream.next() => {
                liveness.touch();
                let inbound = match frame {
                    Some(Ok(Message::Text(text))) => Inbound::Text(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => Inbound::Text(text),
                        Err(_) => Inbound::Undecodable,
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        tracing::warn!(%connection_id, error = %e, "websocket read failed");
                        break CloseReason::TransportError;
                    }
                };
                if inbound_tx.send(inbound).is_err() {
                    tracing::error!(%connection_id, "dispatcher stopped unexpectedly");
                    break CloseReason::WriterClosed;
                }
            }
            dead = &mut dead_rx => break dead.unwrap_or(CloseReason::WriterClosed),
            _ = shutdown.changed() => break CloseReason::ServerShutdown,
        }
    };

    advance(&mut phase, Phase::Closing);
    drop(inbound_tx);
    if reason == CloseReason::ServerShutdown {
        handle.send_frame(Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "Server shutting down".into(),
        })));
    }
    drop(handle);

    // Frames read before the close are still routed, in order, before peers
    // learn that this participant left.
    if let Err(e) = dispatcher.await {
        tracing::error!(%connection_id, error = %e, "dispatcher task failed");
    }

    match state.registry.unregister(&session_id, connection_id) {
        Some(0) => {
            if state.calls.end(&session_id).is_some() {
                tracing::info!("released call state for emptied session");
            }
        }
        Some(remaining) => {
            let delivered = state.registry.broadcast_all(
                &session_id,
                &ServerEnvelope::ParticipantLeft {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                    timestamp: Utc::now(),
                },
            );
            tracing::info!(remaining, delivered, "notified remaining participants");
        }
        None => tracing::warn!(%connection_id, "connection was not registered"),
    }

    advance(&mut phase, Phase::Closed);
    tracing::info!(%connection_id, reason = ?reason, "connection closed");
}

/// Routes inbound frames strictly in arrival order.
async fn dispatch_loop(
    state: AppState,
    mut connection: Connection,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Text(text) => {
                router::route_text(&state, &mut connection, &text).await;
            }
            Inbound::Undecodable => router::reject(&connection, "binary frame is not UTF-8 JSON"),
        }
    }
}

/// Drains the outbound queue and probes the peer with pings.
///
/// Every write is bounded by the heartbeat budget, so a peer that stops
/// reading is reported as dead instead of parking the writer forever.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    heartbeat: Heartbeat,
    liveness: Arc<Liveness>,
    dead: oneshot::Sender<CloseReason>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let write_budget = heartbeat.interval + heartbeat.grace;
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat.interval,
        heartbeat.interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ticker.tick() => {
                let idle = liveness.idle();
                if idle > write_budget {
                    tracing::warn!(idle_ms = idle.as_millis() as u64, "heartbeat expired");
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "Heartbeat timeout".into(),
                    }));
                    let _ = tokio::time::timeout(write_budget, sink.send(close)).await;
                    let _ = dead.send(CloseReason::HeartbeatTimeout);
                    return;
                }
                Message::Ping(Vec::new())
            }
        };

        let closing = matches!(frame, Message::Close(_));
        match tokio::time::timeout(write_budget, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "websocket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(
                    budget_ms = write_budget.as_millis() as u64,
                    "peer stopped reading, dropping connection"
                );
                let _ = dead.send(CloseReason::WriteStalled);
                return;
            }
        }
        if closing {
            break;
        }
    }

    let _ = tokio::time::timeout(write_budget, sink.close()).await;
}
