use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ConnectionKind;

/// Type-specific fields of an envelope, minus the server-stamped metadata.
pub type Payload = Map<String, Value>;

/// Fields the relay owns. Clients may send them but they are replaced on relay.
pub const STAMPED_FIELDS: &[&str] = &["type", "sessionId", "appointmentId", "userId", "timestamp"];

/// Envelope types only the server may originate.
pub const SERVER_RESERVED_TYPES: &[&str] = &[
    "connection-established",
    "participant-left",
    "session-status-response",
    "messages-synced",
    "session-ended",
    "session-end-success",
    "session-end-error",
    "error",
];

/// Ordinal id of a persisted chat message, used as the sync cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Accepts a JSON number or a numeric string, as backends send either.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_u64().map(MessageId),
            Value::String(raw) => raw.trim().parse::<u64>().ok().map(MessageId),
            _ => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("envelope must be a JSON object")]
    NotAnObject,
    #[error("envelope is missing a type")]
    MissingType,
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("envelope type `{0}` is reserved for the server")]
    ReservedType(String),
}

/// Call-setup envelopes relayed verbatim to the other members of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Answer,
    IceCandidate,
    CallAnswered,
    CallRejected,
    CallTimeout,
    CallEnded,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::CallAnswered => "call-answered",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallTimeout => "call-timeout",
            SignalKind::CallEnded => "call-ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    TypingIndicator,
    MessageRead,
}

impl PresenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceKind::TypingIndicator => "typing-indicator",
            PresenceKind::MessageRead => "message-read",
        }
    }
}

/// Every envelope a client can send, validated at the router boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEnvelope {
    Offer(Payload),
    Signal { kind: SignalKind, payload: Payload },
    /// The draft is opaque to the relay; it may be end-to-end encrypted.
    ChatMessage(Payload),
    Presence { kind: PresenceKind, payload: Payload },
    SessionStatusRequest,
    SessionEndRequest { reason: Option<String> },
    SyncMessages { last_message_id: Option<MessageId> },
    ResendOfferRequest,
    Unknown { kind: String, payload: Payload },
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            Some(Value::String(_)) | None => return Err(ProtocolError::MissingType),
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "type",
                    reason: format!("expected a string, got {other}"),
                })
            }
        };

        for key in STAMPED_FIELDS {
            fields.remove(*key);
        }

        let envelope = match kind.as_str() {
            "offer" => ClientEnvelope::Offer(fields),
            "answer" => signal(SignalKind::Answer, fields),
            "ice-candidate" => signal(SignalKind::IceCandidate, fields),
            "call-answered" => signal(SignalKind::CallAnswered, fields),
            "call-rejected" => signal(SignalKind::CallRejected, fields),
            "call-timeout" => signal(SignalKind::CallTimeout, fields),
            "call-ended" => signal(SignalKind::CallEnded, fields),
            "chat-message" => ClientEnvelope::ChatMessage(chat_draft(fields)?),
            "typing-indicator" => ClientEnvelope::Presence {
                kind: PresenceKind::TypingIndicator,
                payload: fields,
            },
            "message-read" => ClientEnvelope::Presence {
                kind: PresenceKind::MessageRead,
                payload: fields,
            },
            "session-status-request" => ClientEnvelope::SessionStatusRequest,
            "session-end-request" => ClientEnvelope::SessionEndRequest {
                reason: fields
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .map(str::to_string),
            },
            "sync-messages" => ClientEnvelope::SyncMessages {
                last_message_id: match fields.get("lastMessageId") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(MessageId::from_value(value).ok_or_else(|| {
                        ProtocolError::InvalidField {
                            field: "lastMessageId",
                            reason: format!("expected a message ordinal, got {value}"),
                        }
                    })?),
                },
            },
            "resend-offer-request" => ClientEnvelope::ResendOfferRequest,
            reserved if SERVER_RESERVED_TYPES.contains(&reserved) => {
                return Err(ProtocolError::ReservedType(kind));
            }
            _ => ClientEnvelope::Unknown {
                kind,
                payload: fields,
            },
        };

        Ok(envelope)
    }

    /// Wire name of the envelope type.
    pub fn kind(&self) -> &str {
        match self {
            ClientEnvelope::Offer(_) => "offer",
            ClientEnvelope::Signal { kind, .. } => kind.as_str(),
            ClientEnvelope::ChatMessage(_) => "chat-message",
            ClientEnvelope::Presence { kind, .. } => kind.as_str(),
            ClientEnvelope::SessionStatusRequest => "session-status-request",
            ClientEnvelope::SessionEndRequest { .. } => "session-end-request",
            ClientEnvelope::SyncMessages { .. } => "sync-messages",
            ClientEnvelope::ResendOfferRequest => "resend-offer-request",
            ClientEnvelope::Unknown { kind, .. } => kind,
        }
    }
}

fn signal(kind: SignalKind, payload: Payload) -> ClientEnvelope {
    ClientEnvelope::Signal { kind, payload }
}

/// Clients nest the draft under `message`; bare drafts are accepted too.
fn chat_draft(mut fields: Payload) -> Result<Payload, ProtocolError> {
    let draft = match fields.remove("message") {
        Some(Value::Object(draft)) => draft,
        Some(other) => {
            fields.insert("message".to_string(), other);
            fields
        }
        None => fields,
    };

    if draft.is_empty() {
        return Err(ProtocolError::InvalidField {
            field: "message",
            reason: "chat message has no content".to_string(),
        });
    }

    Ok(draft)
}

/// A client envelope forwarded to the other members of its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Payload,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl RelayedEnvelope {
    pub fn new(kind: impl Into<String>, payload: Payload, session_id: &str, user_id: &str) -> Self {
        Self {
            kind: kind.into(),
            payload,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidEnvelope,
    Backend,
    Internal,
}

/// Envelopes originated by the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEnvelope {
    ConnectionEstablished {
        session_id: String,
        user_id: String,
        connection_kind: ConnectionKind,
        timestamp: DateTime<Utc>,
    },
    ParticipantLeft {
        session_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    ChatMessage {
        session_id: String,
        message: Value,
        timestamp: DateTime<Utc>,
    },
    SessionStatusResponse {
        session_id: String,
        session_data: Value,
        timestamp: DateTime<Utc>,
    },
    MessagesSynced {
        session_id: String,
        messages: Vec<Value>,
        timestamp: DateTime<Utc>,
    },
    SessionEnded {
        session_id: String,
        reason: String,
        ended_at: DateTime<Utc>,
    },
    SessionEndSuccess {
        session_id: String,
        reason: String,
        ended_at: DateTime<Utc>,
    },
    SessionEndError {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ResendOfferRequest {
        session_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted when a ringing call is never answered.
    CallTimeout {
        session_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerEnvelope {
    pub fn error(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        ServerEnvelope::Error {
            code,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}
