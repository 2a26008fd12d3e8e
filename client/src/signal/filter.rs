//! Consumer-side signal admission: self-origin suppression, duplicate
//! suppression by `(from, kind, sent_at)`, and a staleness window guarding
//! against replay of offers left over from a crashed prior attempt.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use huddle_common::{ParticipantId, Signal, SignalKey};

/// Decides which incoming signals a consumer may apply. One filter instance
/// lives per negotiation attempt.
pub struct SignalFilter {
    local_id: ParticipantId,
    started_at: DateTime<Utc>,
    staleness: chrono::Duration,
    seen: HashSet<SignalKey>,
}

impl SignalFilter {
    /// Create a filter for the given local participant. `staleness` bounds
    /// how far before the filter's creation a signal may have originated.
    pub fn new(local_id: ParticipantId, staleness: Duration) -> Self {
        Self {
            local_id,
            started_at: Utc::now(),
            staleness: chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            seen: HashSet::new(),
        }
    }

    /// Whether the signal should be applied. Records admitted signals so a
    /// redelivery of the same `(from, kind, sent_at)` triple is rejected.
    pub fn admit(&mut self, signal: &Signal) -> bool {
        if signal.from == self.local_id {
            return false;
        }

        if signal.sent_at < self.started_at - self.staleness {
            debug!(
                kind = ?signal.kind,
                from = %signal.from,
                sent_at = %signal.sent_at,
                "ignoring stale signal"
            );
            return false;
        }

        if !self.seen.insert(signal.key()) {
            debug!(kind = ?signal.kind, from = %signal.from, "ignoring duplicate signal");
            return false;
        }

        true
    }
}
