//! Peer Negotiation Engine
//!
//! Owns the WebRTC peer connection for one call attempt and drives SDP
//! offer/answer negotiation plus ICE candidate exchange over the signal
//! channel. One engine instance lives per attempt; nothing here is global,
//! so a failed attempt can be dropped and replaced wholesale.
//!
//! Role discipline: only the initiator ever creates an offer, and at most
//! one per attempt. The joiner answers whatever offer it admits. Candidates
//! arriving before the remote description are queued and flushed once it is
//! applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use huddle_common::{ParticipantId, RoomId, Signal, SignalKind};

use crate::media::LocalMedia;
use crate::signal::{SignalChannel, SignalError, SignalFilter, SignalSubscription};

/// Errors from the negotiation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation was invoked in a state that does not permit it.
    #[error("Negotiation not permitted: {0}")]
    InvalidState(&'static str),

    /// The signaling channel refused a send.
    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    /// Peer connection failure.
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// A signal payload did not parse as the expected description or
    /// candidate shape.
    #[error("Malformed signal payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Which side of the negotiation this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the session and sends the offer.
    Initiator,
    /// Joins the session and answers.
    Joiner,
}

/// Connection state as surfaced to the controller. Collapses the peer and
/// ICE state machines into one progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    fn from_peer(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(Self::New),
            RTCPeerConnectionState::Connecting => Some(Self::Connecting),
            RTCPeerConnectionState::Connected => Some(Self::Connected),
            RTCPeerConnectionState::Disconnected => Some(Self::Disconnected),
            RTCPeerConnectionState::Failed => Some(Self::Failed),
            RTCPeerConnectionState::Closed => Some(Self::Closed),
            RTCPeerConnectionState::Unspecified => None,
        }
    }

    /// ICE-level reading, used when the aggregate peer state is not yet
    /// reported. Some stacks surface ICE transitions first.
    fn from_ice(state: RTCIceConnectionState) -> Option<Self> {
        match state {
            RTCIceConnectionState::Checking => Some(Self::Connecting),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(Self::Connected)
            }
            RTCIceConnectionState::Disconnected => Some(Self::Disconnected),
            RTCIceConnectionState::Failed => Some(Self::Failed),
            RTCIceConnectionState::Closed => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Events emitted by the engine toward the controller.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The collapsed connection state changed.
    StateChanged(PeerConnectionState),
    /// The remote party's media arrived.
    RemoteTrack(Arc<TrackRemote>),
    /// The remote party hung up explicitly.
    RemoteHangup,
}

const EVENT_CAPACITY: usize = 32;

/// The per-attempt negotiation engine.
pub struct PeerEngine {
    room_id: RoomId,
    local_id: ParticipantId,
    role: PeerRole,
    signals: Arc<dyn SignalChannel>,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::Sender<PeerEvent>,
    media: StdMutex<Option<LocalMedia>>,
    // Candidates received before the remote description; flushed once it
    // lands.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_described: AtomicBool,
    offer_sent: AtomicBool,
    offer_outstanding: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl PeerEngine {
    /// Build a peer connection and wire its callbacks. Returns the engine
    /// and the receiver for its events.
    pub async fn new(
        room_id: RoomId,
        local_id: ParticipantId,
        role: PeerRole,
        signals: Arc<dyn SignalChannel>,
        stun_servers: Vec<String>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PeerEvent>), EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let last_state = Arc::new(StdMutex::new(PeerConnectionState::New));

        // Trickle local candidates out as they are gathered.
        {
            let signals = Arc::clone(&signals);
            let room_id = room_id.clone();
            let local_id = local_id.clone();
            let closed = Arc::clone(&closed);
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signals = Arc::clone(&signals);
                let room_id = room_id.clone();
                let local_id = local_id.clone();
                let closed = Arc::clone(&closed);
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    if closed.load(Ordering::Acquire) {
                        return;
                    }
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize local ICE candidate");
                            return;
                        }
                    };
                    let payload = match serde_json::to_value(&init) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "failed to encode ICE candidate payload");
                            return;
                        }
                    };
                    let signal = Signal::new(SignalKind::IceCandidate, local_id, payload);
                    if let Err(e) = signals.send(&room_id, signal).await {
                        warn!(room_id = %room_id, error = %e, "failed to send ICE candidate");
                    }
                })
            }));
        }

        {
            let event_tx = event_tx.clone();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let event_tx = event_tx.clone();
                Box::pin(async move {
                    debug!(
                        kind = ?track.kind(),
                        ssrc = track.ssrc(),
                        "remote track received"
                    );
                    let _ = event_tx.send(PeerEvent::RemoteTrack(track)).await;
                })
            }));
        }

        {
            let event_tx = event_tx.clone();
            let last_state = Arc::clone(&last_state);
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let event_tx = event_tx.clone();
                let last_state = Arc::clone(&last_state);
                Box::pin(async move {
                    if let Some(next) = PeerConnectionState::from_peer(state) {
                        emit_transition(&last_state, next, &event_tx).await;
                    }
                })
            }));
        }

        {
            let event_tx = event_tx.clone();
            let last_state = Arc::clone(&last_state);
            pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let event_tx = event_tx.clone();
                let last_state = Arc::clone(&last_state);
                Box::pin(async move {
                    if let Some(next) = PeerConnectionState::from_ice(state) {
                        emit_transition(&last_state, next, &event_tx).await;
                    }
                })
            }));
        }

        info!(room_id = %room_id, ?role, "peer engine created");

        let engine = Arc::new(Self {
            room_id,
            local_id,
            role,
            signals,
            pc,
            events: event_tx,
            media: StdMutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_described: AtomicBool::new(false),
            offer_sent: AtomicBool::new(false),
            offer_outstanding: AtomicBool::new(false),
            closed,
        });
        Ok((engine, event_rx))
    }

    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Add the local tracks to the connection. Must happen before an offer
    /// is created so the description advertises the media.
    pub async fn attach_media(&self, media: LocalMedia) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::InvalidState("engine is closed"));
        }
        for track in media.tracks() {
            self.pc
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        let mut slot = self.lock_media();
        *slot = Some(media);
        Ok(())
    }

    /// Subscribe to the room's signals and process them until the channel
    /// closes or the call ends.
    pub fn spawn_signal_pump(self: Arc<Self>, staleness: Duration) -> JoinHandle<()> {
        let subscription = self.signals.subscribe(&self.room_id);
        let filter = SignalFilter::new(self.local_id.clone(), staleness);
        tokio::spawn(self.run_signal_pump(subscription, filter))
    }

    async fn run_signal_pump(
        self: Arc<Self>,
        mut subscription: SignalSubscription,
        mut filter: SignalFilter,
    ) {
        while let Some(signal) = subscription.recv().await {
            if self.is_closed() {
                break;
            }
            if !filter.admit(&signal) {
                continue;
            }

            let result = match signal.kind {
                SignalKind::Offer => self.apply_offer(signal.payload).await,
                SignalKind::Answer => self.apply_answer(signal.payload).await,
                SignalKind::IceCandidate => self.apply_candidate(signal.payload).await,
                SignalKind::EndCall => {
                    info!(room_id = %self.room_id, from = %signal.from, "remote hung up");
                    let _ = self.events.send(PeerEvent::RemoteHangup).await;
                    if let Err(e) = self.close().await {
                        warn!(room_id = %self.room_id, error = %e, "close after remote hangup failed");
                    }
                    break;
                }
            };
            if let Err(e) = result {
                warn!(
                    room_id = %self.room_id,
                    kind = ?signal.kind,
                    error = %e,
                    "failed to apply signal"
                );
            }
        }
        debug!(room_id = %self.room_id, "signal pump finished");
    }

    /// Create and send the offer. Initiator-only, and at most once per
    /// attempt; a second call is a no-op.
    pub async fn create_offer(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::InvalidState("engine is closed"));
        }
        if self.role != PeerRole::Initiator {
            return Err(EngineError::InvalidState("only the initiator offers"));
        }
        if self.lock_media().is_none() {
            return Err(EngineError::InvalidState("local media not attached"));
        }
        if self.offer_sent.swap(true, Ordering::AcqRel) {
            debug!(room_id = %self.room_id, "offer already sent, ignoring");
            return Ok(());
        }

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.offer_outstanding.store(true, Ordering::Release);

        let payload = serde_json::to_value(&offer)?;
        self.signals
            .send(
                &self.room_id,
                Signal::new(SignalKind::Offer, self.local_id.clone(), payload),
            )
            .await?;
        info!(room_id = %self.room_id, "offer sent");
        Ok(())
    }

    /// Apply a remote offer and respond with an answer. Answering is the
    /// joiner's job; an initiator receiving an offer indicates crossed
    /// roles and the offer is dropped.
    async fn apply_offer(&self, payload: serde_json::Value) -> Result<(), EngineError> {
        if self.role == PeerRole::Initiator {
            warn!(room_id = %self.room_id, "initiator received an offer, dropping");
            return Ok(());
        }
        let offer: RTCSessionDescription = serde_json::from_value(payload)?;
        self.pc.set_remote_description(offer).await?;
        self.remote_described.store(true, Ordering::Release);
        self.flush_pending_candidates().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        let payload = serde_json::to_value(&answer)?;
        self.signals
            .send(
                &self.room_id,
                Signal::new(SignalKind::Answer, self.local_id.clone(), payload),
            )
            .await?;
        info!(room_id = %self.room_id, "answer sent");
        Ok(())
    }

    /// Apply a remote answer. Answers that no outstanding offer solicited
    /// are dropped.
    async fn apply_answer(&self, payload: serde_json::Value) -> Result<(), EngineError> {
        if !self.offer_outstanding.load(Ordering::Acquire) {
            debug!(room_id = %self.room_id, "ignoring unsolicited answer");
            return Ok(());
        }

        let answer: RTCSessionDescription = serde_json::from_value(payload)?;
        self.pc.set_remote_description(answer).await?;
        // Consume the offer only now: a malformed answer must not eat it
        // and leave a later valid one looking unsolicited.
        self.offer_outstanding.store(false, Ordering::Release);
        self.remote_described.store(true, Ordering::Release);
        self.flush_pending_candidates().await;
        info!(room_id = %self.room_id, "answer applied");
        Ok(())
    }

    async fn apply_candidate(&self, payload: serde_json::Value) -> Result<(), EngineError> {
        let init: RTCIceCandidateInit = serde_json::from_value(payload)?;
        if self.remote_described.load(Ordering::Acquire) {
            self.pc.add_ice_candidate(init).await?;
        } else {
            // Too early to add; hold until the remote description lands.
            self.pending_candidates.lock().await.push(init);
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let queued: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        if queued.is_empty() {
            return;
        }
        debug!(room_id = %self.room_id, count = queued.len(), "flushing queued candidates");
        for init in queued {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(room_id = %self.room_id, error = %e, "failed to add queued candidate");
            }
        }
    }

    /// Flip the local microphone, returning the new enabled state. No-op
    /// returning false when no local media is attached.
    pub fn toggle_audio(&self) -> bool {
        self.lock_media()
            .as_ref()
            .is_some_and(|media| media.audio.toggle())
    }

    /// Flip the local camera, returning the new enabled state. No-op
    /// returning false on an audio-only call.
    pub fn toggle_video(&self) -> bool {
        self.lock_media()
            .as_ref()
            .and_then(|media| media.video.as_ref())
            .is_some_and(|video| video.toggle())
    }

    /// Hang up: notify the remote party, then tear down. Idempotent.
    pub async fn end_call(&self) -> Result<(), EngineError> {
        self.shutdown(true).await
    }

    /// Tear down without notifying the remote party, for when the remote
    /// already ended or the session disappeared. Idempotent.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.shutdown(false).await
    }

    async fn shutdown(&self, notify_remote: bool) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if notify_remote {
            let signal = Signal::new(
                SignalKind::EndCall,
                self.local_id.clone(),
                serde_json::Value::Null,
            );
            if let Err(e) = self.signals.send(&self.room_id, signal).await {
                warn!(room_id = %self.room_id, error = %e, "failed to send hangup signal");
            }
        }

        let media = self.lock_media().take();
        if let Some(media) = media {
            media.stop_all();
        }

        self.pc.close().await?;
        info!(room_id = %self.room_id, "peer engine closed");
        Ok(())
    }

    fn lock_media(&self) -> std::sync::MutexGuard<'_, Option<LocalMedia>> {
        self.media
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}


/// Emit a state event if it differs from the last one. Closed is terminal.
async fn emit_transition(
    last: &StdMutex<PeerConnectionState>,
    next: PeerConnectionState,
    tx: &mpsc::Sender<PeerEvent>,
) {
    {
        let mut current = last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current == next || *current == PeerConnectionState::Closed {
            return;
        }
        *current = next;
    }
    debug!(state = ?next, "peer connection state changed");
    let _ = tx.send(PeerEvent::StateChanged(next)).await;
}
