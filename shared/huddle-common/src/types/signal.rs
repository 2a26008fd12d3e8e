//! Signaling Types
//!
//! Messages exchanged out-of-band to bootstrap the direct peer connection.
//! The channel treats payloads as opaque JSON; only the negotiation engine
//! interprets them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// Kind of signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Session description from the initiator.
    Offer,
    /// Session description from the joiner.
    Answer,
    /// Network-path descriptor for connectivity establishment.
    IceCandidate,
    /// Explicit hangup notification, sent so the remote party reacts
    /// without waiting for registry propagation.
    EndCall,
}

/// Dedup key for a signal: delivery is at-least-once, so consumers apply
/// each `(from, kind, sent_at)` triple at most once.
pub type SignalKey = (ParticipantId, SignalKind, i64);

/// A signaling message scoped to one room's call. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Session description or candidate data, opaque to the channel.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Sender identifier; consumers ignore their own signals.
    pub from: ParticipantId,
    /// Origination time, used for deduplication and staleness filtering.
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    /// Build a signal originating now.
    pub fn new(kind: SignalKind, from: ParticipantId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            from,
            sent_at: Utc::now(),
        }
    }

    /// The `(from, kind, sent_at)` dedup triple, with millisecond timestamp
    /// resolution to keep the key hashable.
    #[must_use]
    pub fn key(&self) -> SignalKey {
        (self.from.clone(), self.kind, self.sent_at.timestamp_millis())
    }
}
