//! Tests for the call lifecycle driver.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use huddle_common::{CallSessionStatus, ParticipantId, RoomId, SignalKind};

    use crate::call::controller::{CallController, CallError, CallStatus, FailReason};
    use crate::call::memory::InMemorySessionStore;
    use crate::call::registry::CallRegistry;
    use crate::chat::{InMemoryMessageStore, MessageStore};
    use crate::config::Config;
    use crate::media::{MediaError, MediaSource, StaticMediaSource};
    use crate::signal::{InMemorySignalChannel, SignalChannel};

    const WAIT: Duration = Duration::from_secs(5);

    struct Backends {
        store: Arc<InMemorySessionStore>,
        signals: Arc<InMemorySignalChannel>,
        messages: Arc<InMemoryMessageStore>,
    }

    impl Backends {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemorySessionStore::new()),
                signals: Arc::new(InMemorySignalChannel::new()),
                messages: Arc::new(InMemoryMessageStore::new()),
            }
        }

        fn registry(&self) -> Arc<CallRegistry> {
            Arc::new(CallRegistry::new(
                Arc::clone(&self.store) as _,
                Arc::clone(&self.signals) as _,
            ))
        }

        fn controller(&self, name: &str) -> CallController {
            self.controller_with_media(name, StaticMediaSource::new())
        }

        fn controller_with_media(&self, name: &str, media: StaticMediaSource) -> CallController {
            CallController::new(
                ParticipantId::from(name),
                self.registry(),
                Arc::clone(&self.signals) as Arc<dyn SignalChannel>,
                Arc::new(media) as Arc<dyn MediaSource>,
                Arc::clone(&self.messages) as Arc<dyn MessageStore>,
                Config::default_for_test(),
            )
        }
    }

    fn room() -> RoomId {
        RoomId::from("r1")
    }

    async fn wait_for_status(
        controller: &CallController,
        predicate: impl FnMut(&CallStatus) -> bool,
    ) -> CallStatus {
        let mut status = controller.status();
        let value = timeout(WAIT, status.wait_for(predicate))
            .await
            .expect("status wait timed out")
            .expect("status channel closed")
            .clone();
        value
    }

    async fn narrations(backends: &Backends) -> Vec<String> {
        let mut sub = backends.messages.subscribe(&room());
        sub.recv()
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_system)
            .map(|m| m.text)
            .collect()
    }

    #[tokio::test]
    async fn start_call_creates_waiting_session_and_narrates() {
        let backends = Backends::new();
        let alice = backends.controller("alice");

        alice.start_call(&room()).await.unwrap();
        assert_eq!(alice.current_status(), CallStatus::Calling);

        let session = backends.registry().session(&room()).await.unwrap().unwrap();
        assert_eq!(session.status, CallSessionStatus::Waiting);
        assert_eq!(session.initiator, ParticipantId::from("alice"));

        let texts = narrations(&backends).await;
        assert_eq!(texts, vec!["alice started a video call".to_owned()]);
    }

    #[tokio::test]
    async fn start_call_twice_is_rejected() {
        let backends = Backends::new();
        let alice = backends.controller("alice");

        alice.start_call(&room()).await.unwrap();
        let result = alice.start_call(&RoomId::from("r2")).await;
        assert!(matches!(result, Err(CallError::AlreadyInCall)));
    }

    #[tokio::test]
    async fn microphone_failure_fails_the_call_and_removes_the_session() {
        let backends = Backends::new();
        let alice = backends.controller_with_media(
            "alice",
            StaticMediaSource::without_microphone(MediaError::PermissionDenied),
        );

        let result = alice.start_call(&room()).await;
        assert!(matches!(result, Err(CallError::Media(_))));
        assert_eq!(
            alice.current_status(),
            CallStatus::Failed {
                reason: FailReason::MediaUnavailable
            }
        );
        assert!(backends.registry().session(&room()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn camera_failure_still_starts_the_call() {
        let backends = Backends::new();
        let alice = backends
            .controller_with_media("alice", StaticMediaSource::without_camera(MediaError::Busy));

        alice.start_call(&room()).await.unwrap();
        assert_eq!(alice.current_status(), CallStatus::Calling);

        // Audio-only call has no camera to toggle; the video toggle is a
        // no-op reporting disabled while the microphone still flips.
        assert!(!alice.toggle_video().await.unwrap());
        assert!(!alice.toggle_audio().await.unwrap());
        assert!(alice.toggle_audio().await.unwrap());
    }

    #[tokio::test]
    async fn join_on_full_session_fails_without_mutating_it() {
        let backends = Backends::new();
        let registry = backends.registry();
        registry
            .create(&room(), &ParticipantId::from("alice"))
            .await
            .unwrap();
        registry
            .join(&room(), &ParticipantId::from("bob"))
            .await
            .unwrap();

        let carol = backends.controller("carol");
        let result = carol.join_call(&room()).await;
        assert!(matches!(result, Err(CallError::CallFull)));
        assert_eq!(
            carol.current_status(),
            CallStatus::Failed {
                reason: FailReason::CallFull
            }
        );

        let session = registry.session(&room()).await.unwrap().unwrap();
        assert_eq!(session.participants.len(), 2);
    }

    #[tokio::test]
    async fn two_party_negotiation_exchanges_one_offer_and_one_answer() {
        let backends = Backends::new();
        let mut observer = backends.signals.subscribe(&room());

        let alice = backends.controller("alice");
        let bob = backends.controller("bob");

        alice.start_call(&room()).await.unwrap();
        bob.join_call(&room()).await.unwrap();

        let session = backends.registry().session(&room()).await.unwrap().unwrap();
        assert_eq!(session.status, CallSessionStatus::Active);

        let mut offers = 0;
        let mut answers = 0;
        let counting = async {
            while let Some(signal) = observer.recv().await {
                match signal.kind {
                    SignalKind::Offer => offers += 1,
                    SignalKind::Answer => answers += 1,
                    _ => {}
                }
                if offers == 1 && answers == 1 {
                    break;
                }
            }
        };
        timeout(WAIT, counting).await.expect("negotiation stalled");
        assert_eq!((offers, answers), (1, 1));

        let texts = narrations(&backends).await;
        assert_eq!(
            texts,
            vec![
                "alice started a video call".to_owned(),
                "bob joined the video call".to_owned(),
            ]
        );

        alice.end_call().await.unwrap();
    }

    #[tokio::test]
    async fn remote_end_tears_down_the_observer_once() {
        let backends = Backends::new();
        let alice = backends.controller("alice");
        let bob = backends.controller("bob");

        alice.start_call(&room()).await.unwrap();
        bob.join_call(&room()).await.unwrap();

        bob.end_call().await.unwrap();
        assert_eq!(
            bob.current_status(),
            CallStatus::Ended { by_remote: false }
        );

        let status = wait_for_status(&alice, |s| {
            matches!(s, CallStatus::Ended { .. } | CallStatus::Failed { .. })
        })
        .await;
        assert_eq!(status, CallStatus::Ended { by_remote: true });

        assert!(backends.registry().session(&room()).await.unwrap().is_none());

        // Exactly one "ended" narration, from the party that ended it.
        let texts = narrations(&backends).await;
        let ended: Vec<_> = texts.iter().filter(|t| t.contains("ended")).collect();
        assert_eq!(ended, vec!["bob ended the video call"]);
    }

    #[tokio::test]
    async fn leave_hands_the_session_to_the_peer_before_it_winds_down() {
        let backends = Backends::new();
        let alice = backends.controller("alice");
        let bob = backends.controller("bob");

        alice.start_call(&room()).await.unwrap();
        bob.join_call(&room()).await.unwrap();

        alice.leave_call().await.unwrap();
        assert_eq!(
            alice.current_status(),
            CallStatus::Ended { by_remote: false }
        );

        // The hangup signal winds bob down; his departure drains the
        // session.
        wait_for_status(&bob, |s| matches!(s, CallStatus::Ended { .. })).await;
        let drained = async {
            loop {
                if backends
                    .registry()
                    .session(&room())
                    .await
                    .unwrap()
                    .is_none()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(WAIT, drained).await.expect("session not drained");

        let texts = narrations(&backends).await;
        let leaves: Vec<_> = texts.iter().filter(|t| t.contains("left")).collect();
        assert_eq!(leaves, vec!["alice left the video call"]);
    }

    #[tokio::test]
    async fn an_unanswered_caller_waits_without_timing_out() {
        let backends = Backends::new();
        let config = Config {
            connect_timeout: Duration::from_millis(100),
            ..Config::default_for_test()
        };
        let alice = CallController::new(
            ParticipantId::from("alice"),
            backends.registry(),
            Arc::clone(&backends.signals) as Arc<dyn SignalChannel>,
            Arc::new(StaticMediaSource::new()) as Arc<dyn MediaSource>,
            Arc::clone(&backends.messages) as Arc<dyn MessageStore>,
            config,
        );

        alice.start_call(&room()).await.unwrap();

        // The window bounds negotiation, not the wait for a joiner: well
        // past it the caller is still calling and the session still open.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(alice.current_status(), CallStatus::Calling);
        assert!(backends.registry().session(&room()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lifecycle_calls_require_an_active_call() {
        let backends = Backends::new();
        let alice = backends.controller("alice");

        assert!(matches!(alice.leave_call().await, Err(CallError::NotInCall)));
        assert!(matches!(alice.end_call().await, Err(CallError::NotInCall)));
        assert!(matches!(
            alice.toggle_audio().await,
            Err(CallError::NotInCall)
        ));
    }

    #[tokio::test]
    async fn a_finished_call_frees_the_controller_for_the_next_one() {
        let backends = Backends::new();
        let alice = backends.controller("alice");

        alice.start_call(&room()).await.unwrap();
        alice.end_call().await.unwrap();

        alice.start_call(&RoomId::from("r2")).await.unwrap();
        assert_eq!(alice.current_status(), CallStatus::Calling);
    }

    #[tokio::test]
    #[ignore = "requires host networking for ICE connectivity"]
    async fn two_party_call_reaches_connected() {
        let backends = Backends::new();
        let alice = backends.controller("alice");
        let bob = backends.controller("bob");

        alice.start_call(&room()).await.unwrap();
        bob.join_call(&room()).await.unwrap();

        let connect = Duration::from_secs(15);
        let mut alice_status = alice.status();
        let mut bob_status = bob.status();
        timeout(connect, alice_status.wait_for(|s| *s == CallStatus::Connected))
            .await
            .expect("initiator did not connect")
            .unwrap();
        timeout(connect, bob_status.wait_for(|s| *s == CallStatus::Connected))
            .await
            .expect("joiner did not connect")
            .unwrap();
    }
}
