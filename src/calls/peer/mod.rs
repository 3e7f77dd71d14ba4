//! Peer session management.
//!
//! A [`PeerConnection`] backend wraps one negotiated media connection; the
//! [`PeerSessionManager`] sits on top of it and enforces the negotiation
//! rules the engine relies on (tracks before descriptions, remote candidates
//! buffered until the remote description is known, local candidates held
//! until the engine can route them, close exactly once).
//!
//! Backends report what happens on the wire as [`PeerEvent`] messages on an
//! unbounded channel instead of callbacks, so the negotiation object never
//! holds orchestration logic.

mod rtc;
mod session;

pub use rtc::{WebRtcConnection, WebRtcConnector};
pub use session::PeerSessionManager;

use async_trait::async_trait;
use peercall_core::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use super::media::{MediaTrack, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("local tracks must be attached before creating a description")]
    NoLocalTracks,
    #[error("description applied out of order: {0}")]
    OutOfOrder(&'static str),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("peer session is closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Backend(String),
}

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
    /// States the engine treats as the end of the call.
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// An inbound track delivered by the peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Handle for reading RTP, present with the `webrtc` backend.
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Tracks received from the other participant during the current call.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    pub(crate) fn attach(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate to relay to the other participant.
    LocalCandidate(IceCandidate),
    /// Inbound media arrived.
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionState),
}

/// Media sections an offer should request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub audio: bool,
    pub video: bool,
}

/// Backend seam for one peer-to-peer media connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self, options: OfferOptions)
    -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates one [`PeerConnection`] per call, wired to report on `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
