//! Call Session Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParticipantId, RoomId};

/// Maximum participants in a call session. Calls are strictly two-party.
pub const MAX_CALL_PARTICIPANTS: usize = 2;

/// Status of a call session, derived from the participant count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSessionStatus {
    /// One participant, waiting for the other party.
    Waiting,
    /// Both participants present.
    Active,
}

/// The authoritative record of a room's call: who is in it and whether it
/// is waiting or active. At most one live session exists per room.
///
/// A session never has zero participants; the last leaver deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    /// Room this session belongs to.
    pub room_id: RoomId,
    /// Participant that created the session. Reassigned to the remaining
    /// participant if the original initiator leaves a two-party session.
    pub initiator: ParticipantId,
    /// Ordered set of participants, unique, at most two.
    pub participants: Vec<ParticipantId>,
    /// Waiting with one participant, active with two.
    pub status: CallSessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Create a fresh waiting session with the initiator as sole participant.
    pub fn new(room_id: RoomId, initiator: ParticipantId) -> Self {
        Self {
            room_id,
            participants: vec![initiator.clone()],
            initiator,
            status: CallSessionStatus::Waiting,
            created_at: Utc::now(),
        }
    }

    /// Whether the session has reached its participant capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.participants.len() >= MAX_CALL_PARTICIPANTS
    }

    /// Whether the given participant is a member of this session.
    #[must_use]
    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.participants.contains(participant)
    }

    /// Status implied by a participant count.
    #[must_use]
    pub const fn status_for(count: usize) -> CallSessionStatus {
        if count >= MAX_CALL_PARTICIPANTS {
            CallSessionStatus::Active
        } else {
            CallSessionStatus::Waiting
        }
    }
}
