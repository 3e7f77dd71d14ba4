//! Local media capture for calls.
//!
//! The adapter owns no protocol logic: it turns a call type into capture
//! constraints, asks a [`MediaDevices`] backend for a stream, and guarantees
//! that every track is stopped exactly once no matter how often `release` is
//! called.
//!
//! - [`MediaConstraints`]: quality hints handed to the device backend
//! - [`MediaStream`] / [`MediaTrack`]: live tracks; clones share the stop flag
//! - [`MediaCapture`]: keeps at most one current stream per engine
//! - [`SampleTrackDevices`]: backend producing sample-fed `webrtc` tracks

mod sample;

pub use sample::SampleTrackDevices;

use async_trait::async_trait;
use log::{debug, info};
use peercall_core::CallType;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    DeviceNotFound(TrackKind),
    #[error("capture device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// What to capture. Audio is always requested; video only for video calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(call_type: CallType, audio: AudioConstraints, video: VideoConstraints) -> Self {
        Self {
            audio,
            video: call_type.has_video().then_some(video),
        }
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

/// One captured track.
///
/// Clones share the same live flag, so stopping any clone stops them all.
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    live: Arc<AtomicBool>,
    source: Option<Arc<TrackLocalStaticSample>>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
            source: None,
        }
    }

    /// Attaches the `webrtc` track the application writes samples into.
    pub fn with_source(mut self, source: Arc<TrackLocalStaticSample>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.source.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stops the track. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .field("source", &self.source.is_some())
            .finish()
    }
}

/// A set of local tracks captured for one call.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
    constraints: MediaConstraints,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>, constraints: MediaConstraints) -> Self {
        Self {
            id: id.into(),
            tracks,
            constraints,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Stops every track; returns how many were still live.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Device seam: opens capture devices for a set of constraints.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens a stream. Denied permission and missing devices are reported,
    /// never retried.
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaAccessError>;

    /// Called once after the last live track of `stream` was stopped.
    fn on_released(&self, _stream: &MediaStream) {}
}

/// Owns the engine's current local stream.
pub struct MediaCapture {
    devices: Arc<dyn MediaDevices>,
    current: Mutex<Option<MediaStream>>,
}

impl MediaCapture {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            current: Mutex::new(None),
        }
    }

    /// Acquires a stream for `constraints`, releasing any previous one first.
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("Releasing previous local stream before acquiring a new one");
            self.release(previous.as_ref());
        }

        debug!(
            "Opening capture devices (audio: ec={} ns={} agc={}, video: {:?})",
            constraints.audio.echo_cancellation,
            constraints.audio.noise_suppression,
            constraints.audio.auto_gain_control,
            constraints.video
        );
        let stream = self.devices.open(constraints).await?;

        let missing = if !stream.has_kind(TrackKind::Audio) {
            Some(TrackKind::Audio)
        } else if constraints.wants_video() && !stream.has_kind(TrackKind::Video) {
            Some(TrackKind::Video)
        } else {
            None
        };
        if let Some(kind) = missing {
            self.release(Some(&stream));
            return Err(MediaAccessError::DeviceNotFound(kind));
        }

        info!(
            "Acquired local stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.clone());
        Ok(stream)
    }

    /// Stops every track of `stream`. Safe to call with `None` or with a
    /// stream that was already released.
    pub fn release(&self, stream: Option<&MediaStream>) -> bool {
        let Some(stream) = stream else {
            return false;
        };

        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| c.id() == stream.id()) {
                *current = None;
            }
        }

        let stopped = stream.stop();
        if stopped == 0 {
            return false;
        }
        debug!("Stopped {} tracks of local stream {}", stopped, stream.id());
        self.devices.on_released(stream);
        true
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
