//! Process-local signal bus.
//!
//! Stands in for the hosted realtime backend: one broadcast channel per
//! room, append-only, live tail only. Used by tests and the loopback
//! configuration where both participants run in one process.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use huddle_common::{RoomId, Signal};

use super::{SignalChannel, SignalError, SignalSubscription};

const DEFAULT_CAPACITY: usize = 64;

/// In-memory [`SignalChannel`] keyed by room.
pub struct InMemorySignalChannel {
    rooms: DashMap<RoomId, broadcast::Sender<Signal>>,
    capacity: usize,
}

impl InMemorySignalChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
        }
    }

    fn room_bus(&self, room_id: &RoomId) -> broadcast::Sender<Signal> {
        self.rooms
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemorySignalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalChannel for InMemorySignalChannel {
    async fn send(&self, room_id: &RoomId, signal: Signal) -> Result<(), SignalError> {
        // A send with no live subscribers is still an append; the bus just
        // has nobody tailing it yet.
        let _ = self.room_bus(room_id).send(signal);
        Ok(())
    }

    fn subscribe(&self, room_id: &RoomId) -> SignalSubscription {
        SignalSubscription::new(self.room_bus(room_id).subscribe())
    }

    async fn purge(&self, room_id: &RoomId) -> Result<(), SignalError> {
        if self.rooms.remove(room_id).is_some() {
            debug!(room_id = %room_id, "purged signal backlog");
        }
        Ok(())
    }
}
