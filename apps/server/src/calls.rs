use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Active,
}

#[derive(Debug)]
struct CallSession {
    caller_id: String,
    status: CallStatus,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ring_timer: Option<AbortHandle>,
}

impl CallSession {
    fn disarm(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Tracks the call in progress for each session (session_id -> call).
#[derive(Clone, Default)]
pub struct CallTracker {
    calls: Arc<DashMap<String, CallSession>>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a ringing call unless one is already ringing or active.
    /// Returns true when a new call was started.
    pub fn begin_ringing(&self, session_id: &str, caller_id: &str) -> bool {
        if self.calls.contains_key(session_id) {
            return false;
        }

        let mut started = false;
        self.calls.entry(session_id.to_string()).or_insert_with(|| {
            started = true;
            CallSession {
                caller_id: caller_id.to_string(),
                status: CallStatus::Ringing,
                started_at: Utc::now(),
                answered_at: None,
                ring_timer: None,
            }
        });
        started
    }

    /// Attach the ring timer to a still-ringing call; aborts it otherwise.
    pub fn arm_ring_timer(&self, session_id: &str, timer: AbortHandle) {
        match self.calls.get_mut(session_id) {
            Some(mut call) if call.status == CallStatus::Ringing => {
                call.disarm();
                call.ring_timer = Some(timer);
            }
            _ => timer.abort(),
        }
    }

    /// Promote a ringing call to active. Returns false if nothing was ringing.
    pub fn mark_answered(&self, session_id: &str) -> bool {
        match self.calls.get_mut(session_id) {
            Some(mut call) if call.status == CallStatus::Ringing => {
                call.disarm();
                call.status = CallStatus::Active;
                call.answered_at = Some(Utc::now());
                tracing::info!(
                    session_id,
                    caller_id = %call.caller_id,
                    ring_ms = (Utc::now() - call.started_at).num_milliseconds(),
                    "call answered"
                );
                true
            }
            _ => false,
        }
    }

    /// End the session's call, whatever its state.
    pub fn end(&self, session_id: &str) -> Option<CallStatus> {
        self.calls.remove(session_id).map(|(_, call)| {
            if let Some(answered_at) = call.answered_at {
                tracing::info!(
                    session_id,
                    duration_secs = (Utc::now() - answered_at).num_seconds(),
                    "call ended"
                );
            }
            call.status
        })
    }

    /// Drop a call that is still ringing for `caller_id`; used by the ring timer.
    pub fn expire_ringing(&self, session_id: &str, caller_id: &str) -> bool {
        self.calls
            .remove_if(session_id, |_, call| {
                call.status == CallStatus::Ringing && call.caller_id == caller_id
            })
            .map(|(_, mut call)| {
                // The timer is the caller here; aborting it would cancel ourselves.
                call.ring_timer = None;
            })
            .is_some()
    }

    pub fn status(&self, session_id: &str) -> Option<CallStatus> {
        self.calls.get(session_id).map(|call| call.status)
    }

    pub fn caller(&self, session_id: &str) -> Option<String> {
        self.calls.get(session_id).map(|call| call.caller_id.clone())
    }

    pub fn in_progress(&self) -> usize {
        self.calls.len()
    }
}
