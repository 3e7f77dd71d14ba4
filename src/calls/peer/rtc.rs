//! `webrtc`-backed peer connection.

use async_trait::async_trait;
use log::{debug, info, warn};
use peercall_core::{IceCandidate, SdpType, SessionDescription};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;

use super::{
    NegotiationError, OfferOptions, PeerConnection, PeerConnectionState, PeerConnector, PeerEvent,
    RemoteTrack,
};
use crate::calls::media::{MediaTrack, TrackKind};

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let SessionDescription { sdp_type, sdp } = description;
    let parsed = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".into(),
            ));
        }
    };
    parsed.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }),
        Err(e) => {
            warn!("Failed to serialize local ICE candidate: {}", e);
            None
        }
    }
}

/// Creates `webrtc` peer connections with the default codecs and interceptors.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let candidate_tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                if let Some(c) = candidate.as_ref().and_then(candidate_from_rtc) {
                    debug!("ICE candidate gathered: {}", c.candidate);
                    let _ = tx.send(PeerEvent::LocalCandidate(c));
                }
            })
        }));

        let track_tx = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track),
                };
                info!("Remote {} track {} attached", remote.kind, remote.id);
                let _ = tx.send(PeerEvent::RemoteTrack(remote));
            })
        }));

        let state_tx = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    info!("Peer connection state: {}", state);
                    if let Some(mapped) = map_state(state) {
                        let _ = tx.send(PeerEvent::ConnectionState(mapped));
                    }
                })
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            peer_connection,
            local_kinds: Mutex::new(HashSet::new()),
        }))
    }
}

/// One `RTCPeerConnection`.
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    local_kinds: Mutex<HashSet<TrackKind>>,
}

impl WebRtcConnection {
    fn has_local(&self, kind: TrackKind) -> bool {
        self.local_kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&kind)
    }

    async fn ensure_receiver(&self, kind: TrackKind) -> Result<(), NegotiationError> {
        if self.has_local(kind) {
            return Ok(());
        }
        let codec_type = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        debug!("No local {} track, offering receive-only", kind);
        self.peer_connection
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_local_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let source = track.source().cloned().ok_or_else(|| {
            NegotiationError::Backend(format!("track {} has no sample source", track.id()))
        })?;
        self.peer_connection
            .add_track(source as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.local_kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(track.kind());
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError> {
        if options.audio {
            self.ensure_receiver(TrackKind::Audio).await?;
        }
        if options.video {
            self.ensure_receiver(TrackKind::Video).await?;
        }
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.peer_connection.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
