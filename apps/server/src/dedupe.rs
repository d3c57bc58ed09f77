use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use shared_proto::signaling::Payload;

/// How long an identical offer from the same sender is treated as a retransmit.
pub const OFFER_TTL: Duration = Duration::from_secs(5 * 60);

/// Only this many characters of the offer take part in the fingerprint.
pub const FINGERPRINT_PREFIX_CHARS: usize = 50;

/// Suppresses duplicate call offers within a sliding window.
pub struct OfferDeduplicator {
    ttl: Duration,
    inner: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    seen: HashMap<String, Instant>,
    /// Insertion order, so eviction only touches matured entries.
    order: VecDeque<(Instant, String)>,
}

impl Entries {
    fn evict_expired(&mut self, now: Instant, ttl: Duration) {
        while let Some((created, key)) = self.order.pop_front() {
            if now.saturating_duration_since(created) < ttl {
                self.order.push_front((created, key));
                break;
            }
            // A newer insert for the same key owns the map slot now.
            if self.seen.get(&key) == Some(&created) {
                self.seen.remove(&key);
            }
        }
    }
}

impl Default for OfferDeduplicator {
    fn default() -> Self {
        Self::new(OFFER_TTL)
    }
}

impl OfferDeduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Entries::default()),
        }
    }

    pub fn should_process(&self, session_id: &str, user_id: &str, payload: &Payload) -> bool {
        self.should_process_at(session_id, user_id, payload, Instant::now())
    }

    pub fn should_process_at(
        &self,
        session_id: &str,
        user_id: &str,
        payload: &Payload,
        now: Instant,
    ) -> bool {
        let key = format!("{session_id}|{user_id}|{}", fingerprint(payload));
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(created) = entries.seen.get(&key) {
            if now.saturating_duration_since(*created) < self.ttl {
                tracing::warn!(session_id, user_id, "duplicate offer suppressed");
                return false;
            }
        }

        entries.evict_expired(now, self.ttl);
        entries.seen.insert(key.clone(), now);
        entries.order.push_back((now, key));
        true
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded prefix of the SDP, falling back to the offer or payload JSON.
fn fingerprint(payload: &Payload) -> String {
    let offer = payload.get("offer");
    let sdp = offer
        .and_then(|offer| offer.get("sdp"))
        .or_else(|| payload.get("sdp"))
        .and_then(Value::as_str);

    match (sdp, offer) {
        (Some(sdp), _) => sdp.chars().take(FINGERPRINT_PREFIX_CHARS).collect(),
        (None, Some(offer)) => json_prefix(offer),
        (None, None) => json_prefix(payload),
    }
}

/// Serializes only as far as the fingerprint needs.
fn json_prefix<T: Serialize + ?Sized>(value: &T) -> String {
    let mut writer = PrefixWriter::default();
    // The writer refuses bytes past its cap, which aborts serialization early.
    let _ = serde_json::to_writer(&mut writer, value);
    String::from_utf8_lossy(&writer.buf)
        .chars()
        .take(FINGERPRINT_PREFIX_CHARS)
        .collect()
}

/// Enough bytes for `FINGERPRINT_PREFIX_CHARS` characters of any width.
const PREFIX_BYTE_CAP: usize = FINGERPRINT_PREFIX_CHARS * 4;

#[derive(Default)]
struct PrefixWriter {
    buf: Vec<u8>,
}

impl io::Write for PrefixWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let room = PREFIX_BYTE_CAP - self.buf.len();
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "fingerprint prefix full"));
        }
        let taken = bytes.len().min(room);
        self.buf.extend_from_slice(&bytes[..taken]);
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
