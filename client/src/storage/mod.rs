//! File Storage
//!
//! Boundary to the hosted object store used for message attachments.
//! Uploads report coarse progress so the UI can render a percentage; the
//! returned URL goes into the message's [`FileAttachment`].
//!
//! [`FileAttachment`]: crate::chat::FileAttachment

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use huddle_common::{ParticipantId, RoomId};

/// Errors from the object store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file exceeds the backend's size cap.
    #[error("File too large: {size} bytes (max: {max})")]
    TooLarge {
        size: u64,
        max: u64,
    },

    /// Backend failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Progress callback, invoked with a 0..=100 percentage.
pub type ProgressFn = Box<dyn Fn(u8) + Send + Sync>;

/// Object-store boundary.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Store a file under the room, returning its URL. `progress` is
    /// invoked at least with 0 and 100.
    async fn upload(
        &self,
        room_id: &RoomId,
        owner: &ParticipantId,
        file_name: &str,
        content_type: &str,
        bytes: Bytes,
        progress: ProgressFn,
    ) -> Result<String, StorageError>;
}

const DEFAULT_MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;

/// In-memory [`FileStorage`] with a deterministic `memory://` URL scheme.
pub struct InMemoryFileStorage {
    objects: DashMap<String, Bytes>,
    max_file_size: u64,
}

impl InMemoryFileStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_file_size(max_file_size: u64) -> Self {
        Self {
            objects: DashMap::new(),
            max_file_size,
        }
    }

    /// Fetch a stored object by its URL.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.objects.get(url).map(|entry| entry.clone())
    }
}

impl Default for InMemoryFileStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(
        &self,
        room_id: &RoomId,
        owner: &ParticipantId,
        file_name: &str,
        content_type: &str,
        bytes: Bytes,
        progress: ProgressFn,
    ) -> Result<String, StorageError> {
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(StorageError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        progress(0);
        let url = format!("memory://{room_id}/{}/{file_name}", Uuid::new_v4());
        debug!(
            room_id = %room_id,
            owner = %owner,
            content_type,
            size,
            "storing upload"
        );
        self.objects.insert(url.clone(), bytes);
        progress(100);

        info!(room_id = %room_id, url = %url, "upload complete");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    use super::*;

    fn room() -> RoomId {
        RoomId::from("r1")
    }

    #[tokio::test]
    async fn upload_returns_a_retrievable_url() {
        let storage = InMemoryFileStorage::new();
        let url = storage
            .upload(
                &room(),
                &ParticipantId::from("alice"),
                "notes.txt",
                "text/plain",
                Bytes::from_static(b"hello"),
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        assert!(url.starts_with("memory://r1/"));
        assert!(url.ends_with("/notes.txt"));
        assert_eq!(storage.get(&url).unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn progress_reaches_completion() {
        let storage = InMemoryFileStorage::new();
        let last = Arc::new(AtomicU8::new(0));
        let observed = Arc::clone(&last);

        storage
            .upload(
                &room(),
                &ParticipantId::from("alice"),
                "notes.txt",
                "text/plain",
                Bytes::from_static(b"hello"),
                Box::new(move |pct| observed.store(pct, Ordering::Release)),
            )
            .await
            .unwrap();

        assert_eq!(last.load(Ordering::Acquire), 100);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let storage = InMemoryFileStorage::with_max_file_size(4);
        let result = storage
            .upload(
                &room(),
                &ParticipantId::from("alice"),
                "big.bin",
                "application/octet-stream",
                Bytes::from_static(b"too big"),
                Box::new(|_| {}),
            )
            .await;

        assert!(matches!(result, Err(StorageError::TooLarge { size: 7, .. })));
    }
}
