//! Room Messages
//!
//! The message store is the boundary to the hosted message collection. The
//! call core uses it for system narration ("alice started a video call");
//! the presentation layer uses it for ordinary chat. Subscribers receive
//! the full ordered message list on every change, matching the snapshot
//! semantics of the hosted backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use huddle_common::{ParticipantId, RoomId};

/// Errors from the message store.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The store backend is unreachable.
    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),
}

/// An uploaded file referenced from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
    pub file_size: u64,
}

/// One room message, chat or system narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: ParticipantId,
    pub text: String,
    /// System narration rather than user chat.
    pub is_system: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<FileAttachment>,
    pub created_at: DateTime<Utc>,
}

/// Storage boundary for room messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to the room's ordered list.
    async fn append(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
        text: &str,
        is_system: bool,
        attachment: Option<FileAttachment>,
    ) -> Result<ChatMessage, ChatError>;

    /// Subscribe to a room's messages. The current list arrives
    /// immediately, then the full list again on every append.
    fn subscribe(&self, room_id: &RoomId) -> MessageSubscription;
}

const SUBSCRIPTION_CAPACITY: usize = 32;

/// Live view over a room's message list.
pub struct MessageSubscription {
    first: Option<Vec<ChatMessage>>,
    rx: broadcast::Receiver<Vec<ChatMessage>>,
}

impl MessageSubscription {
    pub(crate) fn new(current: Vec<ChatMessage>, rx: broadcast::Receiver<Vec<ChatMessage>>) -> Self {
        Self {
            first: Some(current),
            rx,
        }
    }

    /// Next snapshot of the full message list, or `None` once the store is
    /// gone. A lagged receiver skips straight to the newest snapshot, which
    /// supersedes the missed ones.
    pub async fn recv(&mut self) -> Option<Vec<ChatMessage>> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        loop {
            match self.rx.recv().await {
                Ok(messages) => return Some(messages),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "message subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-memory [`MessageStore`], used by tests and the loopback
/// configuration.
pub struct InMemoryMessageStore {
    rooms: Mutex<HashMap<RoomId, Vec<ChatMessage>>>,
    watchers: DashMap<RoomId, broadcast::Sender<Vec<ChatMessage>>>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            watchers: DashMap::new(),
        }
    }

    fn bus(&self, room_id: &RoomId) -> broadcast::Sender<Vec<ChatMessage>> {
        self.watchers
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0)
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RoomId, Vec<ChatMessage>>> {
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
        text: &str,
        is_system: bool,
        attachment: Option<FileAttachment>,
    ) -> Result<ChatMessage, ChatError> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender: sender.clone(),
            text: text.to_owned(),
            is_system,
            attachment,
            created_at: Utc::now(),
        };

        let snapshot = {
            let mut rooms = self.lock();
            let messages = rooms.entry(room_id.clone()).or_default();
            messages.push(message.clone());
            messages.clone()
        };
        let _ = self.bus(room_id).send(snapshot);

        Ok(message)
    }

    fn subscribe(&self, room_id: &RoomId) -> MessageSubscription {
        let rooms = self.lock();
        let current = rooms.get(room_id).cloned().unwrap_or_default();
        let rx = self.bus(room_id).subscribe();
        drop(rooms);
        MessageSubscription::new(current, rx)
    }
}
