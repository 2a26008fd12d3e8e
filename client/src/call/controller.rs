//! Call Controller
//!
//! Drives the lifecycle of one call attempt: registry membership, media
//! acquisition, the negotiation engine, and the status surface the
//! presentation layer observes. Every collaborator is injected at
//! construction; the controller owns no global state and a new attempt
//! starts from a fresh engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use huddle_common::{CallSessionStatus, ParticipantId, RoomId};

use crate::call::registry::{CallRegistry, RegistryError, SessionWatch};
use crate::chat::MessageStore;
use crate::config::Config;
use crate::media::{acquire_with_fallback, LocalMedia, MediaError, MediaSource};
use crate::peer::{EngineError, PeerConnectionState, PeerEngine, PeerEvent, PeerRole};
use crate::signal::SignalChannel;

/// Errors from controller operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// A call attempt is already in progress.
    #[error("Already in a call")]
    AlreadyInCall,

    /// No call attempt is in progress.
    #[error("Not in a call")]
    NotInCall,

    /// The session already has both participants. Not retryable.
    #[error("Call is full")]
    CallFull,

    /// Local media could not be acquired at any tier.
    #[error("Local media unavailable: {0}")]
    Media(#[from] MediaError),

    /// Session registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Negotiation engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Why a call attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// Both seats were taken. Not retryable.
    CallFull,
    /// No usable microphone.
    MediaUnavailable,
    /// The connection did not establish within the configured window.
    Timeout,
    /// The transport failed after negotiation started.
    ConnectionFailed,
}

/// Call lifecycle as observed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// No attempt in progress.
    Idle,
    /// In the session, waiting for the peer connection to start.
    Calling,
    /// Negotiation and connectivity checks under way.
    Connecting,
    /// Media is flowing.
    Connected,
    /// The call finished normally.
    Ended {
        /// Whether the remote party ended it.
        by_remote: bool,
    },
    /// The attempt failed.
    Failed { reason: FailReason },
}

/// How a teardown interacts with the registry and the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownAction {
    /// Depart, keeping the session alive for the remaining participant.
    Leave,
    /// Delete the session for everyone and purge the signal backlog.
    EndForAll,
    /// The remote side already ended; only local cleanup remains.
    RemoteEnded,
    /// The attempt failed; depart quietly.
    Fail,
}

const TRACK_CAPACITY: usize = 8;

/// Everything a call attempt's background tasks need, shared so any of
/// them can run the one-shot teardown.
struct CallContext {
    room_id: RoomId,
    local_id: ParticipantId,
    engine: Arc<PeerEngine>,
    registry: Arc<CallRegistry>,
    messages: Arc<dyn MessageStore>,
    status_tx: watch::Sender<CallStatus>,
    torn_down: AtomicBool,
}

impl CallContext {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Publish a non-terminal status unless the attempt already ended.
    fn set_progress(&self, status: CallStatus) {
        if !self.is_torn_down() {
            debug!(room_id = %self.room_id, ?status, "call status");
            self.status_tx.send_replace(status);
        }
    }

    /// Tear the attempt down exactly once. Later callers are no-ops, so a
    /// local hangup racing a remote deletion resolves cleanly.
    async fn teardown(&self, final_status: CallStatus, action: TeardownAction) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room_id = %self.room_id, ?action, "tearing down call");

        // Notify the remote party over the signal channel where the action
        // calls for it; the session watcher is the backstop.
        let engine_result = match action {
            TeardownAction::Leave | TeardownAction::EndForAll | TeardownAction::Fail => {
                self.engine.end_call().await
            }
            TeardownAction::RemoteEnded => self.engine.close().await,
        };
        if let Err(e) = engine_result {
            warn!(room_id = %self.room_id, error = %e, "engine teardown failed");
        }

        let registry_result = match action {
            TeardownAction::EndForAll => self.registry.end(&self.room_id).await,
            TeardownAction::Leave | TeardownAction::RemoteEnded | TeardownAction::Fail => {
                self.registry.leave(&self.room_id, &self.local_id).await
            }
        };
        if let Err(e) = registry_result {
            warn!(room_id = %self.room_id, error = %e, "registry cleanup failed");
        }

        match action {
            TeardownAction::Leave => self.narrate("left the video call").await,
            TeardownAction::EndForAll => self.narrate("ended the video call").await,
            TeardownAction::RemoteEnded | TeardownAction::Fail => {}
        }

        self.status_tx.send_replace(final_status);
    }

    /// Append system narration; failures are logged, never fatal.
    async fn narrate(&self, what: &str) {
        let text = format!("{} {what}", self.local_id);
        if let Err(e) = self
            .messages
            .append(&self.room_id, &self.local_id, &text, true, None)
            .await
        {
            warn!(room_id = %self.room_id, error = %e, "failed to append narration");
        }
    }
}

/// One live call attempt.
struct ActiveCall {
    ctx: Arc<CallContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The call lifecycle driver for one local participant.
pub struct CallController {
    local_id: ParticipantId,
    registry: Arc<CallRegistry>,
    signals: Arc<dyn SignalChannel>,
    media_source: Arc<dyn MediaSource>,
    messages: Arc<dyn MessageStore>,
    config: Config,
    status_tx: watch::Sender<CallStatus>,
    remote_tracks: broadcast::Sender<Arc<TrackRemote>>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallController {
    pub fn new(
        local_id: ParticipantId,
        registry: Arc<CallRegistry>,
        signals: Arc<dyn SignalChannel>,
        media_source: Arc<dyn MediaSource>,
        messages: Arc<dyn MessageStore>,
        config: Config,
    ) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::Idle);
        let (remote_tracks, _) = broadcast::channel(TRACK_CAPACITY);
        Self {
            local_id,
            registry,
            signals,
            media_source,
            messages,
            config,
            status_tx,
            remote_tracks,
            active: Mutex::new(None),
        }
    }

    /// Observe the call status. The current value is readable immediately.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    /// Current status snapshot.
    #[must_use]
    pub fn current_status(&self) -> CallStatus {
        self.status_tx.borrow().clone()
    }

    /// Observe remote media tracks as they arrive.
    #[must_use]
    pub fn remote_tracks(&self) -> broadcast::Receiver<Arc<TrackRemote>> {
        self.remote_tracks.subscribe()
    }

    /// Start a call in the room: create the session and wait for a joiner.
    /// The offer is produced once the session turns active.
    pub async fn start_call(&self, room_id: &RoomId) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        Self::clear_finished(&mut active);
        if active.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        self.registry.create(room_id, &self.local_id).await?;
        self.status_tx.send_replace(CallStatus::Calling);

        let media = match acquire_with_fallback(self.media_source.as_ref()).await {
            Ok(media) => media,
            Err(e) => {
                // Do not leave a ghost session behind.
                if let Err(end_err) = self.registry.end(room_id).await {
                    warn!(room_id = %room_id, error = %end_err, "cleanup after media failure failed");
                }
                self.status_tx.send_replace(CallStatus::Failed {
                    reason: FailReason::MediaUnavailable,
                });
                return Err(e.into());
            }
        };

        let call = match self
            .launch(room_id, PeerRole::Initiator, media, "started a video call")
            .await
        {
            Ok(call) => call,
            Err(e) => {
                if let Err(end_err) = self.registry.end(room_id).await {
                    warn!(room_id = %room_id, error = %end_err, "cleanup after launch failure failed");
                }
                self.status_tx.send_replace(CallStatus::Failed {
                    reason: FailReason::ConnectionFailed,
                });
                return Err(e);
            }
        };
        *active = Some(call);
        Ok(())
    }

    /// Join the room's waiting call.
    pub async fn join_call(&self, room_id: &RoomId) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        Self::clear_finished(&mut active);
        if active.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let mutated = match self.registry.join(room_id, &self.local_id).await {
            Ok(mutated) => mutated,
            Err(RegistryError::Full { .. }) => {
                self.status_tx.send_replace(CallStatus::Failed {
                    reason: FailReason::CallFull,
                });
                return Err(CallError::CallFull);
            }
            Err(e) => return Err(e.into()),
        };
        self.status_tx.send_replace(CallStatus::Calling);

        let media = match acquire_with_fallback(self.media_source.as_ref()).await {
            Ok(media) => media,
            Err(e) => {
                if let Err(leave_err) = self.registry.leave(room_id, &self.local_id).await {
                    warn!(room_id = %room_id, error = %leave_err, "cleanup after media failure failed");
                }
                self.status_tx.send_replace(CallStatus::Failed {
                    reason: FailReason::MediaUnavailable,
                });
                return Err(e.into());
            }
        };

        // A rejoining initiator keeps the offering role.
        let role = match self.registry.session(room_id).await? {
            Some(session) if session.initiator == self.local_id => PeerRole::Initiator,
            _ => PeerRole::Joiner,
        };

        let narration = if mutated {
            Some("joined the video call")
        } else {
            None
        };
        let call = match self
            .launch_with_narration(room_id, role, media, narration)
            .await
        {
            Ok(call) => call,
            Err(e) => {
                if let Err(leave_err) = self.registry.leave(room_id, &self.local_id).await {
                    warn!(room_id = %room_id, error = %leave_err, "cleanup after launch failure failed");
                }
                self.status_tx.send_replace(CallStatus::Failed {
                    reason: FailReason::ConnectionFailed,
                });
                return Err(e);
            }
        };
        *active = Some(call);
        Ok(())
    }

    /// Depart the call, leaving the session to the remaining participant.
    pub async fn leave_call(&self) -> Result<(), CallError> {
        self.finish(CallStatus::Ended { by_remote: false }, TeardownAction::Leave)
            .await
    }

    /// End the call for everyone: delete the session and purge signals.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.finish(
            CallStatus::Ended { by_remote: false },
            TeardownAction::EndForAll,
        )
        .await
    }

    /// Flip the local microphone, returning the new enabled state. False
    /// when the call carries no microphone track.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = Self::live(&active)?;
        Ok(call.ctx.engine.toggle_audio())
    }

    /// Flip the local camera, returning the new enabled state. False when
    /// the call is audio-only.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = Self::live(&active)?;
        Ok(call.ctx.engine.toggle_video())
    }

    async fn finish(&self, status: CallStatus, action: TeardownAction) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        Self::clear_finished(&mut active);
        let Some(call) = active.take() else {
            return Err(CallError::NotInCall);
        };
        call.ctx.teardown(status, action).await;
        call.abort_tasks();
        Ok(())
    }

    fn live(active: &Option<ActiveCall>) -> Result<&ActiveCall, CallError> {
        match active {
            Some(call) if !call.ctx.is_torn_down() => Ok(call),
            _ => Err(CallError::NotInCall),
        }
    }

    /// Drop an attempt that a background task already tore down.
    fn clear_finished(active: &mut Option<ActiveCall>) {
        if active.as_ref().is_some_and(|call| call.ctx.is_torn_down()) {
            if let Some(call) = active.take() {
                call.abort_tasks();
            }
        }
    }

    async fn launch(
        &self,
        room_id: &RoomId,
        role: PeerRole,
        media: LocalMedia,
        narration: &'static str,
    ) -> Result<ActiveCall, CallError> {
        self.launch_with_narration(room_id, role, media, Some(narration))
            .await
    }

    /// Build the engine and spawn the attempt's background tasks. Local
    /// media is attached before anything can produce an offer, so the
    /// offer gate only needs to observe the session status.
    async fn launch_with_narration(
        &self,
        room_id: &RoomId,
        role: PeerRole,
        media: LocalMedia,
        narration: Option<&'static str>,
    ) -> Result<ActiveCall, CallError> {
        let (engine, events) = PeerEngine::new(
            room_id.clone(),
            self.local_id.clone(),
            role,
            Arc::clone(&self.signals),
            self.config.stun_servers.clone(),
        )
        .await?;

        let pump = Arc::clone(&engine).spawn_signal_pump(self.config.signal_staleness);
        engine.attach_media(media).await?;

        let ctx = Arc::new(CallContext {
            room_id: room_id.clone(),
            local_id: self.local_id.clone(),
            engine,
            registry: Arc::clone(&self.registry),
            messages: Arc::clone(&self.messages),
            status_tx: self.status_tx.clone(),
            torn_down: AtomicBool::new(false),
        });

        if let Some(what) = narration {
            ctx.narrate(what).await;
        }

        let session_watch = self.registry.watch(room_id);
        let watcher = tokio::spawn(run_session_watch(
            Arc::clone(&ctx),
            session_watch,
            role,
            self.config.settle_delay,
        ));
        let event_loop = tokio::spawn(run_event_loop(
            Arc::clone(&ctx),
            events,
            self.remote_tracks.clone(),
        ));
        let timeout_guard = tokio::spawn(run_connect_timeout(
            Arc::clone(&ctx),
            self.config.connect_timeout,
        ));

        Ok(ActiveCall {
            ctx,
            tasks: vec![pump, watcher, event_loop, timeout_guard],
        })
    }
}

/// Watch the session document: open the offer gate when the session turns
/// active, and treat deletion as the remote party ending the call.
async fn run_session_watch(
    ctx: Arc<CallContext>,
    mut watch: SessionWatch,
    role: PeerRole,
    settle_delay: std::time::Duration,
) {
    let mut offer_scheduled = false;
    loop {
        let Some(value) = watch.recv().await else { break };
        if ctx.is_torn_down() {
            break;
        }
        match value {
            Some(session) => {
                if role == PeerRole::Initiator
                    && !offer_scheduled
                    && session.status == CallSessionStatus::Active
                {
                    offer_scheduled = true;
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        // Give the joiner's subscription time to settle so
                        // the offer is not published into the void.
                        sleep(settle_delay).await;
                        if ctx.is_torn_down() {
                            return;
                        }
                        if let Err(e) = ctx.engine.create_offer().await {
                            warn!(room_id = %ctx.room_id, error = %e, "offer failed");
                            ctx.teardown(
                                CallStatus::Failed {
                                    reason: FailReason::ConnectionFailed,
                                },
                                TeardownAction::Fail,
                            )
                            .await;
                        }
                    });
                }
            }
            None => {
                ctx.teardown(
                    CallStatus::Ended { by_remote: true },
                    TeardownAction::RemoteEnded,
                )
                .await;
                break;
            }
        }
    }
}

/// Map engine events onto the call status and forward remote media.
async fn run_event_loop(
    ctx: Arc<CallContext>,
    mut events: mpsc::Receiver<PeerEvent>,
    remote_tracks: broadcast::Sender<Arc<TrackRemote>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::StateChanged(state) => match state {
                PeerConnectionState::Connecting | PeerConnectionState::Disconnected => {
                    ctx.set_progress(CallStatus::Connecting);
                }
                PeerConnectionState::Connected => {
                    ctx.set_progress(CallStatus::Connected);
                }
                PeerConnectionState::Failed => {
                    ctx.teardown(
                        CallStatus::Failed {
                            reason: FailReason::ConnectionFailed,
                        },
                        TeardownAction::Fail,
                    )
                    .await;
                    break;
                }
                PeerConnectionState::New | PeerConnectionState::Closed => {}
            },
            PeerEvent::RemoteTrack(track) => {
                info!(room_id = %ctx.room_id, kind = ?track.kind(), "remote track attached");
                let _ = remote_tracks.send(track);
            }
            PeerEvent::RemoteHangup => {
                ctx.teardown(
                    CallStatus::Ended { by_remote: true },
                    TeardownAction::RemoteEnded,
                )
                .await;
                break;
            }
        }
    }
}

/// Bound the negotiation window: once the attempt starts connecting, fail
/// it if media is not flowing by the deadline. A caller waiting for a
/// joiner is not bounded; the session may be answered at any time.
async fn run_connect_timeout(ctx: Arc<CallContext>, window: std::time::Duration) {
    let mut status = ctx.status_tx.subscribe();
    if status
        .wait_for(|s| *s == CallStatus::Connecting)
        .await
        .is_err()
    {
        return;
    }
    sleep(window).await;
    let stuck = matches!(&*ctx.status_tx.borrow(), CallStatus::Connecting);
    if stuck && !ctx.is_torn_down() {
        warn!(room_id = %ctx.room_id, ?window, "call did not connect in time");
        ctx.teardown(
            CallStatus::Failed {
                reason: FailReason::Timeout,
            },
            TeardownAction::Fail,
        )
        .await;
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;
