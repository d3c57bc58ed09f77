use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use shared_proto::ConnectionKind;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type Tx = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The outbound half of a live connection, as seen by the rest of the relay.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: String,
    pub kind: ConnectionKind,
    tx: Tx,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, kind: ConnectionKind, tx: Tx) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            kind,
            tx,
        }
    }

    /// Queues a frame for the writer task. False once the writer is gone.
    pub fn send_frame(&self, frame: Message) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn send<T: Serialize>(&self, envelope: &T) -> bool {
        match serde_json::to_string(envelope) {
            Ok(text) => self.send_frame(Message::Text(text)),
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "failed to encode envelope");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub active_sessions: usize,
    pub total_connections: usize,
}

/// Maps session id -> live connections of that session.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    groups: Arc<DashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection, creating the session group if needed. Returns the group size.
    pub fn register(&self, session_id: &str, handle: ConnectionHandle) -> usize {
        let mut group = self.groups.entry(session_id.to_string()).or_default();
        group.insert(handle.id, handle);
        group.len()
    }

    /// Removes a connection and drops the group when it empties.
    ///
    /// Returns the number of members left, or `None` if the connection was not registered.
    pub fn unregister(&self, session_id: &str, id: ConnectionId) -> Option<usize> {
        match self.groups.entry(session_id.to_string()) {
            Entry::Occupied(mut group) => {
                group.get_mut().remove(&id)?;
                let remaining = group.get().len();
                if remaining == 0 {
                    group.remove();
                }
                Some(remaining)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Sends to every member except `excluding`. Returns how many accepted the frame.
    pub fn broadcast<T: Serialize>(
        &self,
        session_id: &str,
        envelope: &T,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(session_id, error = %e, "failed to encode broadcast envelope");
                return 0;
            }
        };

        let Some(group) = self.groups.get(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        for handle in group.values() {
            if Some(handle.id) == excluding {
                continue;
            }
            if handle.send_frame(Message::Text(text.clone())) {
                delivered += 1;
            } else {
                tracing::warn!(
                    session_id,
                    connection_id = %handle.id,
                    user_id = %handle.user_id,
                    "skipping delivery to closed connection"
                );
            }
        }

        tracing::debug!(session_id, delivered, members = group.len(), "broadcast complete");
        delivered
    }

    pub fn broadcast_all<T: Serialize>(&self, session_id: &str, envelope: &T) -> usize {
        self.broadcast(session_id, envelope, None)
    }

    /// Total live connections across all sessions.
    pub fn count_all(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    pub fn session_count(&self) -> usize {
        self.groups.len()
    }

    pub fn connections_in(&self, session_id: &str) -> usize {
        self.groups.get(session_id).map(|group| group.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot {
            active_sessions: 0,
            total_connections: 0,
        };
        for group in self.groups.iter() {
            snapshot.active_sessions += 1;
            snapshot.total_connections += group.len();
        }
        snapshot
    }
}
