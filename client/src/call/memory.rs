//! Process-local session store.
//!
//! Mirrors the hosted document database at the [`SessionStore`] boundary:
//! one document per room, compare-and-swap writes, broadcast fan-out to
//! watchers. Used by tests and the loopback configuration.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use huddle_common::{CallSession, RoomId};

use super::registry::{RegistryError, SessionStore, SessionWatch};

const WATCH_CAPACITY: usize = 16;

/// In-memory [`SessionStore`].
pub struct InMemorySessionStore {
    // Single lock over all documents keeps compare_and_swap trivially
    // serializable; session churn is two writers per room at most.
    sessions: Mutex<HashMap<RoomId, CallSession>>,
    watchers: DashMap<RoomId, broadcast::Sender<Option<CallSession>>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            watchers: DashMap::new(),
        }
    }

    fn watch_bus(&self, room_id: &RoomId) -> broadcast::Sender<Option<CallSession>> {
        self.watchers
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RoomId, CallSession>> {
        // The map lock is never held across an await point, so poisoning
        // only happens if a panic already failed the test.
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, room_id: &RoomId) -> Result<Option<CallSession>, RegistryError> {
        Ok(self.lock().get(room_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        room_id: &RoomId,
        expected: Option<&CallSession>,
        new: Option<CallSession>,
    ) -> Result<bool, RegistryError> {
        let bus = self.watch_bus(room_id);
        let mut sessions = self.lock();
        if sessions.get(room_id) != expected {
            return Ok(false);
        }
        let notification = match new {
            Some(session) => {
                sessions.insert(room_id.clone(), session.clone());
                Some(session)
            }
            None => {
                sessions.remove(room_id);
                None
            }
        };

        // Published while the map lock is held so watchers observe writes
        // in commit order; the broadcast send never blocks.
        let _ = bus.send(notification);
        Ok(true)
    }

    fn watch(&self, room_id: &RoomId) -> SessionWatch {
        // Snapshot and subscribe under the same lock so the immediate value
        // and the live tail cannot miss or duplicate a mutation between
        // them; compare_and_swap publishes under the same lock.
        let sessions = self.lock();
        let current = sessions.get(room_id).cloned();
        let rx = self.watch_bus(room_id).subscribe();
        drop(sessions);
        SessionWatch::new(current, rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use huddle_common::{CallSession, CallSessionStatus, ParticipantId, RoomId};

    use super::*;

    fn activated(session: &CallSession) -> CallSession {
        let mut active = session.clone();
        active.participants.push(ParticipantId::from("bob"));
        active.status = CallSessionStatus::Active;
        active
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_delivers_racing_writes_in_commit_order() {
        for _ in 0..200 {
            let store = Arc::new(InMemorySessionStore::new());
            let room = RoomId::from("r1");
            let waiting = CallSession::new(room.clone(), ParticipantId::from("alice"));
            assert!(store
                .compare_and_swap(&room, None, Some(waiting.clone()))
                .await
                .unwrap());
            let mut watch = store.watch(&room);
            let active = activated(&waiting);

            let join = {
                let store = Arc::clone(&store);
                let room = room.clone();
                let waiting = waiting.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    assert!(store
                        .compare_and_swap(&room, Some(&waiting), Some(active))
                        .await
                        .unwrap());
                })
            };
            let end = {
                let store = Arc::clone(&store);
                let room = room.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    loop {
                        if store.load(&room).await.unwrap().as_ref() == Some(&active) {
                            assert!(store
                                .compare_and_swap(&room, Some(&active), None)
                                .await
                                .unwrap());
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            };
            join.await.unwrap();
            end.await.unwrap();

            // The deletion committed last, so its notification arrives
            // last: a watcher never sees the session resurrect after the
            // absence.
            assert_eq!(watch.recv().await, Some(Some(waiting.clone())));
            assert_eq!(watch.recv().await, Some(Some(active)));
            assert_eq!(watch.recv().await, Some(None));
        }
    }
}
