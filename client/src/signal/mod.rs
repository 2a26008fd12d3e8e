//! Signal Channel
//!
//! Out-of-band delivery of offer/answer/candidate/end-call messages between
//! the two participants of a room's call. Delivery is at-least-once with no
//! ordering guarantee across producers; consumers run every incoming signal
//! through a [`SignalFilter`] before acting on it.

mod filter;
mod memory;

pub use filter::SignalFilter;
pub use memory::InMemorySignalChannel;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use huddle_common::{RoomId, Signal};

/// Errors from the signaling channel.
#[derive(Debug, Error)]
pub enum SignalError {
    /// The channel backend is unreachable. Transient; the caller surfaces
    /// this as a failed call rather than retrying in a loop.
    #[error("Signaling channel unavailable: {0}")]
    ChannelUnavailable(String),
}

/// Transport for signaling messages, injected into the negotiation engine
/// and controller rather than resolved through ambient state.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Append a signal to the room's channel, visible to all current
    /// subscribers within delivery latency.
    async fn send(&self, room_id: &RoomId, signal: Signal) -> Result<(), SignalError>;

    /// Subscribe to signals appended after this call. No replay of earlier
    /// signals; dropping the subscription unsubscribes.
    fn subscribe(&self, room_id: &RoomId) -> SignalSubscription;

    /// Best-effort removal of a room's signal backlog after a call ends.
    async fn purge(&self, room_id: &RoomId) -> Result<(), SignalError>;
}

/// Live tail over a room's signal channel.
pub struct SignalSubscription {
    rx: broadcast::Receiver<Signal>,
}

impl SignalSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<Signal>) -> Self {
        Self { rx }
    }

    /// Receive the next signal, or `None` once the channel is closed.
    ///
    /// A lagged receiver skips the overwritten backlog and keeps tailing;
    /// lost entries are tolerated because the channel only bootstraps the
    /// peer connection.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signal subscription lagged, skipping backlog");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
