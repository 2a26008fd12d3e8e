//! Local Media
//!
//! Acquisition of the local audio/video tracks behind a capture boundary.
//! The call core never talks to devices directly; a [`MediaSource`]
//! implementation wraps whatever the platform provides. Acquisition walks a
//! constraint ladder: ideal video, then basic video, then audio-only.
//! Camera failures degrade the call; microphone failures fail it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media acquisition failures, distinguished by reason so the UI can give
/// actionable guidance.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    /// No such capture device.
    #[error("Capture device not found")]
    NotFound,

    /// The user or platform denied access.
    #[error("Capture permission denied")]
    PermissionDenied,

    /// The device is held by another application.
    #[error("Capture device in use by another application")]
    Busy,

    /// Backend failure outside the device taxonomy.
    #[error("Media backend error: {0}")]
    Backend(String),
}

/// Requested video capture quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoProfile {
    /// Preferred resolution/framerate.
    Ideal,
    /// Lowest-common-denominator constraints.
    Basic,
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Audio capture; always requested.
    pub audio: bool,
    /// Video capture tier, `None` for audio-only.
    pub video: Option<VideoProfile>,
}

impl MediaConstraints {
    /// Preferred tier: audio plus ideal video.
    #[must_use]
    pub const fn ideal() -> Self {
        Self {
            audio: true,
            video: Some(VideoProfile::Ideal),
        }
    }

    /// Middle tier: audio plus basic video.
    #[must_use]
    pub const fn basic() -> Self {
        Self {
            audio: true,
            video: Some(VideoProfile::Basic),
        }
    }

    /// Last tier: audio only.
    #[must_use]
    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }
}

/// Kind of a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A locally captured track plus its mute state. The enabled flag is
/// consulted by the capture pipeline; toggling never renegotiates.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled state, returning the new state.
    pub fn toggle(&self) -> bool {
        // fetch_xor flips atomically and returns the previous value.
        !self.enabled.fetch_xor(true, Ordering::AcqRel)
    }

    /// Stop the track. Idempotent; a stopped track never produces samples
    /// again.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// The local media set for one call attempt: required audio, optional
/// video. Exclusively owned by one negotiation engine instance.
#[derive(Clone)]
pub struct LocalMedia {
    pub audio: LocalTrack,
    pub video: Option<LocalTrack>,
}

impl LocalMedia {
    /// All tracks, audio first.
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        std::iter::once(&self.audio).chain(self.video.as_ref())
    }

    /// Stop every track. Idempotent.
    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Platform capture boundary.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture local media matching the constraints.
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Acquire local media, degrading through the constraint ladder. Video
/// failures fall through to the next tier; an audio failure at the final
/// tier is fatal.
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
) -> Result<LocalMedia, MediaError> {
    let ladder = [
        MediaConstraints::ideal(),
        MediaConstraints::basic(),
        MediaConstraints::audio_only(),
    ];

    let mut last_err = MediaError::NotFound;
    for constraints in &ladder {
        match source.capture(constraints).await {
            Ok(media) => {
                info!(
                    video = media.video.is_some(),
                    "local media acquired"
                );
                return Ok(media);
            }
            Err(e) => {
                warn!(?constraints, error = %e, "media capture tier failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Deterministic in-process media source producing silent/blank sample
/// tracks. Serves tests and the loopback configuration; can be scripted to
/// fail per device to exercise the fallback ladder.
pub struct StaticMediaSource {
    camera_error: Option<MediaError>,
    microphone_error: Option<MediaError>,
}

impl StaticMediaSource {
    /// A source where both devices work.
    #[must_use]
    pub fn new() -> Self {
        Self {
            camera_error: None,
            microphone_error: None,
        }
    }

    /// A source whose camera fails with the given reason.
    #[must_use]
    pub fn without_camera(reason: MediaError) -> Self {
        Self {
            camera_error: Some(reason),
            microphone_error: None,
        }
    }

    /// A source whose microphone fails with the given reason.
    #[must_use]
    pub fn without_microphone(reason: MediaError) -> Self {
        Self {
            camera_error: None,
            microphone_error: Some(reason),
        }
    }

    fn audio_track() -> LocalTrack {
        LocalTrack::new(
            TrackKind::Audio,
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                "huddle-local".to_owned(),
            )),
        )
    }

    fn video_track() -> LocalTrack {
        LocalTrack::new(
            TrackKind::Video,
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                "huddle-local".to_owned(),
            )),
        )
    }
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio {
            if let Some(reason) = &self.microphone_error {
                return Err(reason.clone());
            }
        }

        let video = match constraints.video {
            Some(_) => {
                if let Some(reason) = &self.camera_error {
                    return Err(reason.clone());
                }
                Some(Self::video_track())
            }
            None => None,
        };

        Ok(LocalMedia {
            audio: Self::audio_track(),
            video,
        })
    }
}
