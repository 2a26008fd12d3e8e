//! Tests for call session registry semantics.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use huddle_common::{CallSessionStatus, ParticipantId, RoomId, Signal, MAX_CALL_PARTICIPANTS};

    use crate::call::memory::InMemorySessionStore;
    use crate::call::registry::{CallRegistry, RegistryError};
    use crate::signal::{InMemorySignalChannel, SignalChannel, SignalError, SignalSubscription};

    fn registry() -> CallRegistry {
        CallRegistry::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemorySignalChannel::new()),
        )
    }

    fn room() -> RoomId {
        RoomId::from("r1")
    }

    #[tokio::test]
    async fn create_then_join_activates_session() {
        let registry = registry();
        let session = registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        assert_eq!(session.status, CallSessionStatus::Waiting);

        let mutated = registry
            .join(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();
        assert!(mutated);

        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.status, CallSessionStatus::Active);
        assert_eq!(
            session.participants,
            vec![ParticipantId::from("alice"), ParticipantId::from("bob")]
        );
    }

    #[tokio::test]
    async fn create_fails_when_session_exists() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        let result = registry.create(&room(), &ParticipantId::from("bob")).await;
        assert!(matches!(result, Err(RegistryError::AlreadyExists)));
    }

    #[tokio::test]
    async fn join_without_session_is_not_found() {
        let registry = registry();
        let result = registry.join(&room(), &ParticipantId::from("bob")).await;
        assert!(matches!(result, Err(RegistryError::NotFound)));
    }

    #[tokio::test]
    async fn third_participant_is_rejected() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        registry
            .join(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();

        let result = registry.join(&room(), &ParticipantId::from("carol")).await;
        assert!(matches!(
            result,
            Err(RegistryError::Full {
                max_participants: MAX_CALL_PARTICIPANTS
            })
        ));

        // Session unchanged.
        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.participants.len(), 2);
        assert!(!session.contains(&ParticipantId::from("carol")));
    }

    #[tokio::test]
    async fn rejoin_is_idempotent() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        let mutated = registry
            .join(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        assert!(!mutated);

        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.participants.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_joins_produce_exactly_one_winner() {
        let registry = Arc::new(registry());
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .join(&room(), &ParticipantId::new(format!("joiner-{i}")))
                    .await
            }));
        }

        let mut winners = 0;
        let mut full = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(true) => winners += 1,
                Ok(false) => panic!("no joiner was already a member"),
                Err(RegistryError::Full { .. }) => full += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(full, 7);

        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.participants.len(), 2);
        assert_eq!(session.status, CallSessionStatus::Active);
    }

    #[tokio::test]
    async fn initiator_leave_promotes_remaining_participant() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        registry
            .join(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();

        registry
            .leave(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.initiator, ParticipantId::from("bob"));
        assert_eq!(session.participants, vec![ParticipantId::from("bob")]);
        assert_eq!(session.status, CallSessionStatus::Waiting);
    }

    #[tokio::test]
    async fn last_leaver_deletes_session_with_one_absence_notification() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        registry
            .join(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();

        let mut watch = registry.watch(&room());
        // Immediate snapshot.
        assert!(watch.recv().await.unwrap().is_some());

        registry
            .leave(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        registry
            .leave(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();

        // One mutation for alice's departure, then exactly one absence.
        assert!(watch.recv().await.unwrap().is_some());
        assert!(watch.recv().await.unwrap().is_none());

        assert!(registry.session(&room()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leave_of_unknown_participant_is_a_no_op() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        registry
            .leave(&room(), &ParticipantId::from("mallory"))
            .await
            .unwrap();

        assert!(registry.session(&room()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_delivers_absence_immediately_for_missing_session() {
        let registry = registry();
        let mut watch = registry.watch(&room());
        assert!(watch.recv().await.unwrap().is_none());
    }

    /// Channel whose purge always fails, to verify `end` stays best-effort.
    struct FailingPurgeChannel;

    #[async_trait]
    impl SignalChannel for FailingPurgeChannel {
        async fn send(&self, _room_id: &RoomId, _signal: Signal) -> Result<(), SignalError> {
            Ok(())
        }

        fn subscribe(&self, _room_id: &RoomId) -> SignalSubscription {
            SignalSubscription::new(tokio::sync::broadcast::channel(1).1)
        }

        async fn purge(&self, _room_id: &RoomId) -> Result<(), SignalError> {
            Err(SignalError::ChannelUnavailable("purge refused".into()))
        }
    }

    #[tokio::test]
    async fn end_succeeds_even_when_signal_purge_fails() {
        let registry = CallRegistry::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(FailingPurgeChannel),
        );
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        registry.end(&room()).await.unwrap();
        assert!(registry.session(&room()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let registry = registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();

        registry.end(&room()).await.unwrap();
        registry.end(&room()).await.unwrap();
    }
}
