pub mod signaling;

use serde::{Deserialize, Serialize};

/// Which endpoint a connection was accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    Call,
    Chat,
    LegacyCall,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Call => "call",
            ConnectionKind::Chat => "chat",
            ConnectionKind::LegacyCall => "legacy-call",
        }
    }

    /// Both the canonical and the legacy call endpoints carry call signaling.
    pub fn is_call(self) -> bool {
        matches!(self, ConnectionKind::Call | ConnectionKind::LegacyCall)
    }
}
