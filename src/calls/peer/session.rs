use log::{debug, warn};
use peercall_core::{CallType, IceCandidate, SdpType, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use super::{
    NegotiationError, OfferOptions, PeerConnection, PeerConnectionState, PeerConnector, PeerEvent,
};
use crate::calls::media::MediaStream;

#[derive(Default)]
struct RemoteNegotiation {
    described: bool,
    pending: Vec<IceCandidate>,
}

/// Local candidates are held here until the engine knows where to send them.
struct TrickleGate {
    open: bool,
    held: Vec<IceCandidate>,
}

/// Owns exactly one peer connection for one call.
pub struct PeerSessionManager {
    connection: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    tracks_attached: AtomicBool,
    local_described: AtomicBool,
    remote: AsyncMutex<RemoteNegotiation>,
    trickle: Arc<Mutex<TrickleGate>>,
    state: Arc<Mutex<PeerConnectionState>>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSessionManager {
    /// Creates a connection through `connector`. Everything it reports is
    /// forwarded to `events`, except local candidates, which wait for
    /// [`start_trickle`](Self::start_trickle).
    pub async fn open(
        connector: &dyn PeerConnector,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, NegotiationError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let connection = connector.connect(raw_tx).await?;

        let trickle = Arc::new(Mutex::new(TrickleGate {
            open: false,
            held: Vec::new(),
        }));
        let state = Arc::new(Mutex::new(PeerConnectionState::New));
        let pump = tokio::spawn(pump_events(
            raw_rx,
            events.clone(),
            trickle.clone(),
            state.clone(),
        ));

        Ok(Self {
            connection,
            events,
            tracks_attached: AtomicBool::new(false),
            local_described: AtomicBool::new(false),
            remote: AsyncMutex::new(RemoteNegotiation::default()),
            trickle,
            state,
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn ensure_tracks(&self) -> Result<(), NegotiationError> {
        if !self.tracks_attached.load(Ordering::Acquire) {
            return Err(NegotiationError::NoLocalTracks);
        }
        Ok(())
    }

    /// Adds every track of the local stream to the connection.
    pub async fn attach_local_stream(&self, stream: &MediaStream) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if stream.tracks().is_empty() {
            return Err(NegotiationError::NoLocalTracks);
        }
        for track in stream.tracks() {
            self.connection.add_local_track(track).await?;
        }
        self.tracks_attached.store(true, Ordering::Release);
        Ok(())
    }

    /// Caller side: builds and applies the local offer. Audio is always
    /// requested, video only for video calls.
    pub async fn create_offer(
        &self,
        call_type: CallType,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.ensure_tracks()?;
        if self.local_described.swap(true, Ordering::AcqRel) {
            return Err(NegotiationError::OutOfOrder("local description already set"));
        }

        let offer = self
            .connection
            .create_offer(OfferOptions {
                audio: true,
                video: call_type.has_video(),
            })
            .await?;
        self.connection.set_local_description(offer.clone()).await?;
        debug!("Created local {} offer", call_type);
        Ok(offer)
    }

    /// Receiver side: applies the remote offer and returns the local answer.
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.ensure_tracks()?;
        if offer.sdp_type != SdpType::Offer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected offer, got {}",
                offer.sdp_type
            )));
        }
        if self.local_described.swap(true, Ordering::AcqRel) {
            return Err(NegotiationError::OutOfOrder("local description already set"));
        }

        let mut remote = self.remote.lock().await;
        if remote.described {
            return Err(NegotiationError::OutOfOrder("remote description already set"));
        }
        self.connection.set_remote_description(offer).await?;
        remote.described = true;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.flush_remote_candidates(&mut remote).await;
        Ok(answer)
    }

    /// Caller side: completes negotiation with the receiver's answer.
    pub async fn apply_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if answer.sdp_type != SdpType::Answer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected answer, got {}",
                answer.sdp_type
            )));
        }
        if !self.local_described.load(Ordering::Acquire) {
            return Err(NegotiationError::OutOfOrder("answer before local offer"));
        }

        let mut remote = self.remote.lock().await;
        if remote.described {
            return Err(NegotiationError::OutOfOrder("remote description already set"));
        }
        self.connection.set_remote_description(answer).await?;
        remote.described = true;
        self.flush_remote_candidates(&mut remote).await;
        Ok(())
    }

    /// Feeds a trickled candidate. Candidates that arrive before the remote
    /// description are buffered and applied, in arrival order, once it is set.
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let mut remote = self.remote.lock().await;
        if !remote.described {
            debug!("Buffering remote candidate until the remote description is set");
            remote.pending.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    async fn flush_remote_candidates(&self, remote: &mut RemoteNegotiation) {
        if remote.pending.is_empty() {
            return;
        }
        debug!("Applying {} buffered remote candidates", remote.pending.len());
        for candidate in std::mem::take(&mut remote.pending) {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Dropping buffered remote candidate: {}", e);
            }
        }
    }

    pub async fn pending_remote_candidates(&self) -> usize {
        self.remote.lock().await.pending.len()
    }

    /// Releases held local candidates and lets later ones through directly.
    pub fn start_trickle(&self) {
        let mut gate = self.trickle.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.open {
            return;
        }
        gate.open = true;
        for candidate in gate.held.drain(..) {
            if self.events.send(PeerEvent::LocalCandidate(candidate)).is_err() {
                break;
            }
        }
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. Only the first call does anything.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PeerConnectionState::Closed;
        true
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

async fn pump_events(
    mut raw: mpsc::UnboundedReceiver<PeerEvent>,
    events: mpsc::UnboundedSender<PeerEvent>,
    trickle: Arc<Mutex<TrickleGate>>,
    state: Arc<Mutex<PeerConnectionState>>,
) {
    while let Some(event) = raw.recv().await {
        let forward = match event {
            PeerEvent::LocalCandidate(candidate) => {
                let mut gate = trickle.lock().unwrap_or_else(PoisonError::into_inner);
                if !gate.open {
                    gate.held.push(candidate);
                    continue;
                }
                // Sent under the gate so flushed candidates keep discovery order.
                if events.send(PeerEvent::LocalCandidate(candidate)).is_err() {
                    break;
                }
                continue;
            }
            PeerEvent::ConnectionState(s) => {
                *state.lock().unwrap_or_else(PoisonError::into_inner) = s;
                PeerEvent::ConnectionState(s)
            }
            other => other,
        };
        if events.send(forward).is_err() {
            break;
        }
    }
}
