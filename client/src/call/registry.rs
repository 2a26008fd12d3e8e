//! Call Session Registry
//!
//! Create/join/leave/end semantics over an atomic session store. The store
//! is the boundary to the hosted document database; every mutation goes
//! through a compare-and-swap so that two participants racing for the
//! second slot resolve to exactly one winner.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use huddle_common::{CallSession, ParticipantId, RoomId, MAX_CALL_PARTICIPANTS};

use crate::signal::SignalChannel;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live session already exists for the room.
    #[error("Call session already exists")]
    AlreadyExists,

    /// No live session exists for the room.
    #[error("Call session not found")]
    NotFound,

    /// The session already has the maximum number of participants.
    #[error("Call is full (max: {max_participants})")]
    Full {
        /// Maximum allowed participants.
        max_participants: usize,
    },

    /// Storage backend failure.
    #[error("Session store error: {0}")]
    Store(String),
}

/// Storage boundary for call sessions.
///
/// Implementations must make `compare_and_swap` atomic with respect to
/// concurrent writers; the registry never performs an unconditional
/// read-modify-write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the current session for a room, if any.
    async fn load(&self, room_id: &RoomId) -> Result<Option<CallSession>, RegistryError>;

    /// Atomically replace the session if the stored value equals
    /// `expected`. `new: None` deletes. Returns `false` when the
    /// precondition failed and nothing was written.
    async fn compare_and_swap(
        &self,
        room_id: &RoomId,
        expected: Option<&CallSession>,
        new: Option<CallSession>,
    ) -> Result<bool, RegistryError>;

    /// Watch a room's session: the current value (or absence) is delivered
    /// immediately, then every mutation. Deletion is observed as exactly
    /// one `None`.
    fn watch(&self, room_id: &RoomId) -> SessionWatch;
}

/// Live view over one room's session document.
pub struct SessionWatch {
    first: Option<Option<CallSession>>,
    rx: broadcast::Receiver<Option<CallSession>>,
}

impl SessionWatch {
    pub(crate) fn new(
        current: Option<CallSession>,
        rx: broadcast::Receiver<Option<CallSession>>,
    ) -> Self {
        Self {
            first: Some(current),
            rx,
        }
    }

    /// Next observed value: `Some(Some(_))` a session snapshot,
    /// `Some(None)` the session is absent, `None` the watch ended.
    pub async fn recv(&mut self) -> Option<Option<CallSession>> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session watch lagged, skipping intermediate states");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Registry of per-room call sessions. Owns all writes; participants hold
/// read access through [`SessionStore::watch`].
pub struct CallRegistry {
    store: Arc<dyn SessionStore>,
    signals: Arc<dyn SignalChannel>,
}

impl CallRegistry {
    pub fn new(store: Arc<dyn SessionStore>, signals: Arc<dyn SignalChannel>) -> Self {
        Self { store, signals }
    }

    /// Create a waiting session with the initiator as sole participant.
    pub async fn create(
        &self,
        room_id: &RoomId,
        initiator: &ParticipantId,
    ) -> Result<CallSession, RegistryError> {
        if self.store.load(room_id).await?.is_some() {
            return Err(RegistryError::AlreadyExists);
        }

        let session = CallSession::new(room_id.clone(), initiator.clone());
        if self
            .store
            .compare_and_swap(room_id, None, Some(session.clone()))
            .await?
        {
            info!(room_id = %room_id, initiator = %initiator, "call session created");
            Ok(session)
        } else {
            // Lost a creation race.
            Err(RegistryError::AlreadyExists)
        }
    }

    /// Add a participant to the session. Returns whether the join mutated
    /// state: rejoining as an existing member is an idempotent no-op.
    pub async fn join(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<bool, RegistryError> {
        loop {
            let session = self
                .store
                .load(room_id)
                .await?
                .ok_or(RegistryError::NotFound)?;

            if session.contains(participant) {
                debug!(room_id = %room_id, participant = %participant, "idempotent rejoin");
                return Ok(false);
            }
            if session.is_full() {
                return Err(RegistryError::Full {
                    max_participants: MAX_CALL_PARTICIPANTS,
                });
            }

            let mut next = session.clone();
            next.participants.push(participant.clone());
            next.status = CallSession::status_for(next.participants.len());

            if self
                .store
                .compare_and_swap(room_id, Some(&session), Some(next))
                .await?
            {
                info!(room_id = %room_id, participant = %participant, "participant joined call");
                return Ok(true);
            }
            // Raced with another writer; re-read and re-evaluate.
        }
    }

    /// Remove a participant. Deletes the session when it empties; promotes
    /// the remaining participant to initiator when the initiator departs.
    pub async fn leave(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), RegistryError> {
        loop {
            let Some(session) = self.store.load(room_id).await? else {
                return Ok(());
            };
            if !session.contains(participant) {
                return Ok(());
            }

            let mut next = session.clone();
            next.participants.retain(|p| p != participant);

            let new = if next.participants.is_empty() {
                None
            } else {
                if next.initiator == *participant {
                    // Keep a well-defined offer role for later rejoins.
                    next.initiator = next.participants[0].clone();
                    debug!(
                        room_id = %room_id,
                        new_initiator = %next.initiator,
                        "initiator left, promoting remaining participant"
                    );
                }
                next.status = CallSession::status_for(next.participants.len());
                Some(next)
            };

            if self
                .store
                .compare_and_swap(room_id, Some(&session), new)
                .await?
            {
                info!(room_id = %room_id, participant = %participant, "participant left call");
                return Ok(());
            }
        }
    }

    /// Unconditionally delete the session, then clean up the signal
    /// backlog. Backlog cleanup is best-effort: the staleness filter is the
    /// backstop, so a purge failure does not fail the end.
    pub async fn end(&self, room_id: &RoomId) -> Result<(), RegistryError> {
        loop {
            let Some(session) = self.store.load(room_id).await? else {
                break;
            };
            if self
                .store
                .compare_and_swap(room_id, Some(&session), None)
                .await?
            {
                info!(room_id = %room_id, "call session ended");
                break;
            }
        }

        if let Err(e) = self.signals.purge(room_id).await {
            warn!(room_id = %room_id, error = %e, "failed to purge call signals");
        }
        Ok(())
    }

    /// Current session snapshot.
    pub async fn session(&self, room_id: &RoomId) -> Result<Option<CallSession>, RegistryError> {
        self.store.load(room_id).await
    }

    /// Watch a room's session document.
    pub fn watch(&self, room_id: &RoomId) -> SessionWatch {
        self.store.watch(room_id)
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
