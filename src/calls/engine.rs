//! Call negotiation engine.
//!
//! One [`CallEngine`] per signed-in user. It sequences media capture, the
//! peer session and the call record service into the observable call
//! lifecycle, and owns the only copy of the current call's resources.
//!
//! All mutable state lives behind one async mutex. Steps that talk to the
//! outside world (device access, HTTP, SDP generation) run without the lock;
//! whatever they produce is adopted into the session only if the attempt is
//! still live, otherwise it is released on the spot. Teardown removes the
//! session under the lock, so it runs exactly once no matter how many causes
//! race to end the call.

use log::{debug, info, warn};
use peercall_core::{
    CallId, CallRecord, CallType, ConversationId, IceCandidate, SessionDescription,
    SignalingEvent, SignalingTransport, UserId, other_participant,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::error::CallError;
use super::media::{
    AudioConstraints, MediaCapture, MediaConstraints, MediaDevices, MediaStream, VideoConstraints,
};
use super::peer::{
    PeerConnectionState, PeerConnector, PeerEvent, PeerSessionManager, RemoteStream,
};
use super::records::{CallRecordService, OfferRequest};
use super::state::{CallDirection, CallPhase, CallTransition, EndReason, InvalidTransition};

/// Signals that arrive before the engine can route them are kept up to this many.
const MAX_EARLY_SIGNALS: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ice_servers: Vec<String>,
    /// Reject a second incoming call while one is in progress instead of ignoring it.
    pub reject_when_busy: bool,
    pub event_capacity: usize,
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            reject_when_busy: true,
            event_capacity: 100,
            audio: AudioConstraints::default(),
            video: VideoConstraints::default(),
        }
    }
}

/// What the UI renders. Replaced as a whole on every change.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub phase: CallPhase,
    pub current_call: Option<CallRecord>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<RemoteStream>,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallPhase),
    /// A call is ringing on this side; answer or reject it.
    IncomingCall(CallRecord),
    RemoteStreamAttached(RemoteStream),
    /// The relay connection closed. A call in progress keeps its media but
    /// can no longer exchange candidates or hang up remotely.
    SignalingLost,
    /// The call reached a terminal condition. `call_id` is `None` when it
    /// ended before the record service assigned one.
    Ended {
        call_id: Option<CallId>,
        reason: EndReason,
    },
}

/// Identity and cancellation flag of one `start_call`/incoming call.
struct CallAttempt {
    id: u64,
    cancelled: AtomicBool,
    reason: StdMutex<Option<EndReason>>,
}

impl CallAttempt {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: AtomicBool::new(false),
            reason: StdMutex::new(None),
        }
    }

    fn cancel(&self, reason: EndReason) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn reason(&self) -> EndReason {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(EndReason::LocalHangup)
    }

    /// The error an in-flight step reports once the attempt was torn down.
    fn error(&self) -> CallError {
        self.reason().into_error()
    }

    fn checkpoint(&self) -> Result<(), CallError> {
        if self.is_cancelled() {
            return Err(self.error());
        }
        Ok(())
    }
}

struct Session {
    attempt: Arc<CallAttempt>,
    direction: CallDirection,
    call_type: CallType,
    record: Option<CallRecord>,
    peer_user: Option<UserId>,
    peer: Option<Arc<PeerSessionManager>>,
    local: Option<MediaStream>,
    remote: RemoteStream,
    answer_applied: bool,
    early: Vec<SignalingEvent>,
}

impl Session {
    fn stash(&mut self, event: SignalingEvent) {
        if self.early.len() >= MAX_EARLY_SIGNALS {
            warn!("Dropping early {} event, buffer full", event.name());
            return;
        }
        debug!("Holding early {} event until the call is routable", event.name());
        self.early.push(event);
    }
}

enum Route<'a> {
    /// The event belongs to the current call.
    Known(&'a mut Session),
    /// An outgoing call whose record is still being created.
    Pending(&'a mut Session),
    Unknown,
}

#[derive(Default)]
struct EngineInner {
    phase: CallPhase,
    session: Option<Session>,
    next_attempt: u64,
    /// Candidates that reached an idle engine ahead of their `incoming-call`.
    orphans: Vec<SignalingEvent>,
}

impl EngineInner {
    fn begin(
        &mut self,
        direction: CallDirection,
        call_type: CallType,
        record: Option<CallRecord>,
        peer_user: Option<UserId>,
    ) -> Arc<CallAttempt> {
        self.next_attempt += 1;
        let attempt = Arc::new(CallAttempt::new(self.next_attempt));
        let orphans = std::mem::take(&mut self.orphans);
        let early = match &record {
            Some(r) => orphans.into_iter().filter(|e| e.call_id() == &r.id).collect(),
            None => Vec::new(),
        };
        self.session = Some(Session {
            attempt: attempt.clone(),
            direction,
            call_type,
            record,
            peer_user,
            peer: None,
            local: None,
            remote: RemoteStream::default(),
            answer_applied: false,
            early,
        });
        attempt
    }

    fn hold_orphan(&mut self, event: SignalingEvent) {
        if self.orphans.len() >= MAX_EARLY_SIGNALS {
            warn!("Dropping {} event for unknown call, buffer full", event.name());
            return;
        }
        debug!("Holding {} for call {} until it rings", event.name(), event.call_id());
        self.orphans.push(event);
    }

    fn live(&mut self, attempt_id: u64) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|s| s.attempt.id == attempt_id && !s.attempt.is_cancelled())
    }

    fn route(&mut self, call_id: &CallId) -> Route<'_> {
        match self.session.as_mut() {
            Some(s) if s.record.as_ref().is_some_and(|r| &r.id == call_id) => Route::Known(s),
            Some(s) if s.record.is_none() => Route::Pending(s),
            _ => Route::Unknown,
        }
    }
}

pub struct CallEngine {
    self_id: UserId,
    config: EngineConfig,
    signaling: Arc<dyn SignalingTransport>,
    records: Arc<dyn CallRecordService>,
    media: MediaCapture,
    connector: Arc<dyn PeerConnector>,
    inner: Mutex<EngineInner>,
    snapshot: watch::Sender<EngineSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    pub fn new(
        self_id: UserId,
        config: EngineConfig,
        signaling: Arc<dyn SignalingTransport>,
        records: Arc<dyn CallRecordService>,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (snapshot, _) = watch::channel(EngineSnapshot::default());
        Arc::new(Self {
            self_id,
            config,
            signaling,
            records,
            media: MediaCapture::new(devices),
            connector,
            inner: Mutex::new(EngineInner::default()),
            snapshot,
            events,
        })
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connects the signaling transport and starts dispatching its events.
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<JoinHandle<()>, CallError> {
        let rx = self.signaling.connect(credential).await.map_err(|e| {
            warn!("Signaling connect failed: {:#}", e);
            CallError::SignalingUnavailable
        })?;
        Ok(self.spawn_signaling(rx))
    }

    /// Dispatches every event from `rx` until it closes or the engine is dropped.
    pub fn spawn_signaling(self: &Arc<Self>, mut rx: mpsc::Receiver<SignalingEvent>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.handle_signaling(event).await;
            }
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if engine.is_call_in_progress() {
                warn!("Signaling stream closed during call in phase {}", engine.state().name());
            } else {
                info!("Signaling stream closed");
            }
            let _ = engine.events.send(CallEvent::SignalingLost);
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> CallPhase {
        self.snapshot.borrow().phase.clone()
    }

    pub fn is_call_active(&self) -> bool {
        self.snapshot.borrow().phase.is_active()
    }

    pub fn is_call_in_progress(&self) -> bool {
        self.snapshot.borrow().phase.is_in_progress()
    }

    pub fn current_call(&self) -> Option<CallRecord> {
        self.snapshot.borrow().current_call.clone()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.snapshot.borrow().remote_stream.clone()
    }

    fn publish(&self, inner: &EngineInner) {
        let session = inner.session.as_ref();
        self.snapshot.send_replace(EngineSnapshot {
            phase: inner.phase.clone(),
            current_call: session.and_then(|s| s.record.clone()),
            local_stream: session.and_then(|s| s.local.clone()),
            remote_stream: session
                .map(|s| s.remote.clone())
                .filter(|r| !r.is_empty()),
        });
    }

    fn transition(
        &self,
        inner: &mut EngineInner,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let next = inner.phase.apply(transition)?;
        info!("Call phase {} -> {}", inner.phase.name(), next.name());
        inner.phase = next;
        self.publish(inner);
        let _ = self.events.send(CallEvent::StateChanged(inner.phase.clone()));
        Ok(())
    }

    fn spawn_peer_events(self: &Arc<Self>, attempt_id: u64) -> mpsc::UnboundedSender<PeerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_peer_event(attempt_id, event).await;
            }
        });
        tx
    }

    /// Places a call in `conversation_id`. Returns once the record service
    /// has persisted the offer; the call becomes active when the peer answers
    /// and the connection comes up.
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        call_type: CallType,
    ) -> Result<CallRecord, CallError> {
        let attempt = {
            let mut inner = self.inner.lock().await;
            if !inner.phase.is_idle() {
                return Err(CallError::CallInProgress);
            }
            if !self.signaling.is_connected() {
                return Err(CallError::SignalingUnavailable);
            }
            let attempt = inner.begin(CallDirection::Outgoing, call_type, None, None);
            self.transition(&mut inner, CallTransition::Dial)?;
            attempt
        };
        info!("Starting {} call in conversation {}", call_type, conversation_id);

        match self.run_outgoing(&attempt, conversation_id, call_type).await {
            Ok(record) => Ok(record),
            Err(_) if attempt.is_cancelled() => Err(attempt.error()),
            Err(err) => {
                warn!("Outgoing call failed: {}", err);
                self.finish(attempt.id, err.end_reason()).await;
                Err(err)
            }
        }
    }

    async fn run_outgoing(
        self: &Arc<Self>,
        attempt: &Arc<CallAttempt>,
        conversation_id: ConversationId,
        call_type: CallType,
    ) -> Result<CallRecord, CallError> {
        let stream = self.acquire_media(attempt, call_type).await?;
        let peer = self.open_peer(attempt).await?;

        peer.attach_local_stream(&stream).await?;
        let offer = peer.create_offer(call_type).await?;
        attempt.checkpoint()?;

        let request = OfferRequest {
            conversation_id,
            call_type,
            offer,
        };
        let record = self
            .records
            .create_offer(&request)
            .await
            .map_err(|e| CallError::RecordService(format!("{e:#}")))?;
        let peer_user = other_participant(&record, &self.self_id)?.clone();

        let early = {
            let mut inner = self.inner.lock().await;
            match inner.live(attempt.id) {
                Some(session) => {
                    session.record = Some(record.clone());
                    session.peer_user = Some(peer_user);
                    let early = std::mem::take(&mut session.early);
                    self.transition(&mut inner, CallTransition::OfferPersisted)?;
                    early
                }
                None => {
                    drop(inner);
                    info!("Call {} was cancelled while being created", record.id);
                    self.notify_remote(&record, attempt.reason()).await;
                    return Err(attempt.error());
                }
            }
        };
        info!("Call {} created, ringing {}", record.id, record.receiver_id);

        peer.start_trickle();
        for event in early {
            if event.call_id() == &record.id {
                self.handle_signaling(event).await;
            } else {
                debug!("Discarding early {} event for call {}", event.name(), event.call_id());
            }
        }
        attempt.checkpoint()?;
        Ok(record)
    }

    /// Answers the ringing call `record`. The record's own call type is
    /// authoritative; `call_type` is only checked against it.
    pub async fn answer_call(
        self: &Arc<Self>,
        record: &CallRecord,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let (attempt, record) = {
            let mut inner = self.inner.lock().await;
            let incoming = inner.phase.is_incoming();
            let session = match inner.route(&record.id) {
                Route::Known(s) if incoming => s,
                _ => return Err(CallError::NotFound(record.id.to_string())),
            };
            let attempt = session.attempt.clone();
            let Some(known) = session.record.clone() else {
                return Err(CallError::NotFound(record.id.to_string()));
            };
            if call_type != known.call_type {
                warn!(
                    "Answering call {} as {} although {} was requested",
                    known.id, known.call_type, call_type
                );
            }
            (attempt, known)
        };

        if !self.signaling.is_connected() {
            self.finish(attempt.id, EndReason::SignalingUnavailable).await;
            return Err(CallError::SignalingUnavailable);
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.live(attempt.id).is_none() {
                return Err(attempt.error());
            }
            self.transition(&mut inner, CallTransition::LocalAnswered)?;
        }
        info!("Answering {} call {}", record.call_type, record.id);

        match self.run_incoming(&attempt, &record).await {
            Ok(()) => Ok(()),
            Err(_) if attempt.is_cancelled() => Err(attempt.error()),
            Err(err) => {
                warn!("Answering call {} failed: {}", record.id, err);
                self.finish(attempt.id, err.end_reason()).await;
                Err(err)
            }
        }
    }

    async fn run_incoming(
        self: &Arc<Self>,
        attempt: &Arc<CallAttempt>,
        record: &CallRecord,
    ) -> Result<(), CallError> {
        let caller = other_participant(record, &self.self_id)?.clone();
        let offer = record
            .offer
            .clone()
            .ok_or_else(|| CallError::NegotiationFailed("call record carries no offer".into()))?;

        let stream = self.acquire_media(attempt, record.call_type).await?;
        let peer = self.open_peer(attempt).await?;
        peer.attach_local_stream(&stream).await?;

        let early = {
            let mut inner = self.inner.lock().await;
            inner
                .live(attempt.id)
                .map(|s| std::mem::take(&mut s.early))
                .unwrap_or_default()
        };
        for event in early {
            self.handle_signaling(event).await;
        }

        let answer = peer.accept_offer(offer).await?;
        attempt.checkpoint()?;
        self.records
            .answer(&record.id, &answer)
            .await
            .map_err(|e| CallError::RecordService(format!("{e:#}")))?;
        attempt.checkpoint()?;
        self.signaling
            .emit(SignalingEvent::answered(record.id.clone(), answer, caller))
            .await
            .map_err(|e| {
                warn!("Failed to send answer for call {}: {:#}", record.id, e);
                CallError::SignalingUnavailable
            })?;

        peer.start_trickle();
        Ok(())
    }

    /// Declines the ringing call `call_id` and tells the caller.
    pub async fn reject_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let attempt_id = {
            let mut inner = self.inner.lock().await;
            let incoming = inner.phase.is_incoming();
            match inner.route(call_id) {
                Route::Known(s) if incoming => s.attempt.id,
                _ => return Err(CallError::NotFound(call_id.to_string())),
            }
        };
        info!("Rejecting call {}", call_id);
        self.finish(attempt_id, EndReason::LocalRejected).await;
        Ok(())
    }

    /// Hangs up or cancels the current call. A no-op when there is none.
    pub async fn end_call(&self) {
        let attempt_id = {
            let inner = self.inner.lock().await;
            match inner.session.as_ref() {
                Some(s) => s.attempt.id,
                None => {
                    debug!("end_call with no call in progress");
                    return;
                }
            }
        };
        self.finish(attempt_id, EndReason::LocalHangup).await;
    }

    async fn acquire_media(
        &self,
        attempt: &CallAttempt,
        call_type: CallType,
    ) -> Result<MediaStream, CallError> {
        let constraints = MediaConstraints::for_call(call_type, self.config.audio, self.config.video);
        let stream = self.media.acquire(&constraints).await?;

        let mut inner = self.inner.lock().await;
        match inner.live(attempt.id) {
            Some(session) => {
                session.local = Some(stream.clone());
                self.publish(&inner);
                Ok(stream)
            }
            None => {
                self.media.release(Some(&stream));
                Err(attempt.error())
            }
        }
    }

    async fn open_peer(
        self: &Arc<Self>,
        attempt: &CallAttempt,
    ) -> Result<Arc<PeerSessionManager>, CallError> {
        let events = self.spawn_peer_events(attempt.id);
        let peer = Arc::new(PeerSessionManager::open(self.connector.as_ref(), events).await?);

        let adopted = {
            let mut inner = self.inner.lock().await;
            match inner.live(attempt.id) {
                Some(session) => {
                    session.peer = Some(peer.clone());
                    true
                }
                None => false,
            }
        };
        if !adopted {
            peer.close().await;
            return Err(attempt.error());
        }
        Ok(peer)
    }

    /// Feeds one inbound signaling event into the engine.
    pub async fn handle_signaling(&self, event: SignalingEvent) {
        if let Some(target) = event.target_user_id()
            && target != &self.self_id
        {
            debug!("Ignoring {} addressed to {}", event.name(), target);
            return;
        }
        debug!("Received {} for call {}", event.name(), event.call_id());

        match event {
            SignalingEvent::IncomingCall { call, .. } => self.on_incoming_call(call).await,
            SignalingEvent::CallAnswered {
                call_id, answer, ..
            } => self.on_call_answered(call_id, answer).await,
            SignalingEvent::CallRejected { call_id, .. } => {
                self.on_remote_terminal(call_id, EndReason::PeerRejected, true)
                    .await
            }
            SignalingEvent::CallEnded { call_id, .. } => {
                self.on_remote_terminal(call_id, EndReason::PeerEnded, false)
                    .await
            }
            SignalingEvent::IceCandidate {
                call_id, candidate, ..
            } => self.on_remote_candidate(call_id, candidate).await,
        }
    }

    async fn on_incoming_call(&self, record: CallRecord) {
        if !record.is_receiver(&self.self_id) {
            warn!("Ignoring incoming call {} not addressed to us", record.id);
            return;
        }
        let caller = record.caller_id.clone();

        {
            let mut inner = self.inner.lock().await;
            if inner.phase.is_idle() {
                inner.begin(
                    CallDirection::Incoming,
                    record.call_type,
                    Some(record.clone()),
                    Some(caller),
                );
                if let Err(e) = self.transition(&mut inner, CallTransition::OfferReceived) {
                    warn!("Cannot accept incoming call {}: {}", record.id, e);
                    inner.session = None;
                    return;
                }
                info!(
                    "Incoming {} call {} from {}",
                    record.call_type, record.id, record.caller_id
                );
                let _ = self.events.send(CallEvent::IncomingCall(record));
                return;
            }
            if matches!(inner.route(&record.id), Route::Known(_)) {
                debug!("Duplicate incoming-call for {}", record.id);
                return;
            }
        }

        if !self.config.reject_when_busy {
            warn!("Ignoring incoming call {} while busy", record.id);
            return;
        }
        info!("Busy, rejecting incoming call {}", record.id);
        self.notify_remote(&record, EndReason::LocalRejected).await;
    }

    async fn on_call_answered(&self, call_id: CallId, answer: SessionDescription) {
        let (attempt_id, peer) = {
            let mut inner = self.inner.lock().await;
            let negotiating = inner.phase.is_negotiating();
            match inner.route(&call_id) {
                Route::Known(s) => {
                    if s.direction != CallDirection::Outgoing {
                        warn!("Unexpected answer for incoming call {}", call_id);
                        return;
                    }
                    if s.answer_applied || !negotiating {
                        debug!("Ignoring repeated answer for call {}", call_id);
                        return;
                    }
                    let Some(peer) = s.peer.clone() else {
                        return;
                    };
                    s.answer_applied = true;
                    (s.attempt.id, peer)
                }
                Route::Pending(s) => {
                    s.stash(SignalingEvent::CallAnswered {
                        call_id,
                        answer,
                        target_user_id: None,
                    });
                    return;
                }
                Route::Unknown => {
                    warn!("Answer for unknown call {}", call_id);
                    return;
                }
            }
        };

        info!("Call {} answered", call_id);
        if let Err(e) = peer.apply_remote_answer(answer).await {
            warn!("Could not apply answer for call {}: {}", call_id, e);
            self.finish(attempt_id, EndReason::NegotiationFailed).await;
        }
    }

    async fn on_remote_terminal(&self, call_id: CallId, reason: EndReason, caller_only: bool) {
        let attempt_id = {
            let mut inner = self.inner.lock().await;
            match inner.route(&call_id) {
                Route::Known(s) => {
                    if caller_only && s.direction != CallDirection::Outgoing {
                        warn!("Ignoring rejection of incoming call {}", call_id);
                        return;
                    }
                    s.attempt.id
                }
                Route::Pending(s) => {
                    let event = match reason {
                        EndReason::PeerRejected => SignalingEvent::CallRejected {
                            call_id,
                            target_user_id: None,
                        },
                        _ => SignalingEvent::CallEnded {
                            call_id,
                            target_user_id: None,
                        },
                    };
                    s.stash(event);
                    return;
                }
                Route::Unknown => {
                    debug!("Terminal event for unknown call {}", call_id);
                    return;
                }
            }
        };
        info!("Call {} ended remotely ({:?})", call_id, reason);
        self.finish(attempt_id, reason).await;
    }

    async fn on_remote_candidate(&self, call_id: CallId, candidate: IceCandidate) {
        let peer = {
            let mut inner = self.inner.lock().await;
            let idle = inner.session.is_none();
            let peer = match inner.route(&call_id) {
                Route::Known(s) => s.peer.clone(),
                Route::Pending(_) => None,
                Route::Unknown if !idle => {
                    debug!("Candidate for unknown call {}", call_id);
                    return;
                }
                Route::Unknown => None,
            };
            match peer {
                Some(peer) => peer,
                None => {
                    let event = SignalingEvent::IceCandidate {
                        call_id,
                        candidate,
                        target_user_id: None,
                    };
                    match inner.session.as_mut() {
                        Some(session) => session.stash(event),
                        None => inner.hold_orphan(event),
                    }
                    return;
                }
            }
        };
        if let Err(e) = peer.add_remote_candidate(candidate).await {
            warn!("Dropping remote candidate for call {}: {}", call_id, e);
        }
    }

    async fn handle_peer_event(&self, attempt_id: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let route = {
                    let mut inner = self.inner.lock().await;
                    inner.live(attempt_id).and_then(|s| {
                        let record = s.record.as_ref()?;
                        Some((record.id.clone(), s.peer_user.clone()?))
                    })
                };
                let Some((call_id, target)) = route else {
                    debug!("Dropping local candidate for a call that is gone");
                    return;
                };
                if let Err(e) = self
                    .signaling
                    .emit(SignalingEvent::candidate(call_id, candidate, target))
                    .await
                {
                    warn!("Failed to send local candidate: {:#}", e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let mut inner = self.inner.lock().await;
                let Some(session) = inner.live(attempt_id) else {
                    return;
                };
                session.remote.attach(track);
                let remote = session.remote.clone();
                self.publish(&inner);
                let _ = self.events.send(CallEvent::RemoteStreamAttached(remote));
            }
            PeerEvent::ConnectionState(PeerConnectionState::Connected) => {
                let mut inner = self.inner.lock().await;
                if inner.live(attempt_id).is_none() || !inner.phase.is_negotiating() {
                    return;
                }
                if let Err(e) = self.transition(&mut inner, CallTransition::MediaConnected) {
                    warn!("{}", e);
                }
            }
            PeerEvent::ConnectionState(state) if state.is_lost() => {
                let reason = if self.inner.lock().await.phase.is_active() {
                    EndReason::ConnectionLost
                } else {
                    EndReason::NegotiationFailed
                };
                info!("Peer connection {:?}, ending call", state);
                self.finish(attempt_id, reason).await;
            }
            PeerEvent::ConnectionState(state) => {
                debug!("Peer connection state {:?}", state);
            }
        }
    }

    /// Tears down attempt `attempt_id`. Returns `false` when it was already
    /// torn down or is not the current attempt.
    async fn finish(&self, attempt_id: u64, reason: EndReason) -> bool {
        let record = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session.take_if(|s| s.attempt.id == attempt_id) else {
                return false;
            };
            session.attempt.cancel(reason);

            if let Some(peer) = &session.peer {
                peer.close().await;
            }
            self.media.release(session.local.as_ref());

            if let Err(e) = self.transition(&mut inner, CallTransition::Terminated { reason }) {
                warn!("{}", e);
            }
            let call_id = session.record.as_ref().map(|r| r.id.clone());
            let _ = self.events.send(CallEvent::Ended { call_id, reason });
            if let Err(e) = self.transition(&mut inner, CallTransition::Reset) {
                warn!("{}", e);
            }
            inner.orphans.clear();
            session.record
        };

        match &record {
            Some(r) => info!("Call {} ended ({:?})", r.id, reason),
            None => info!("Call attempt ended before creation ({:?})", reason),
        }
        if reason.notifies_peer()
            && let Some(record) = &record
        {
            self.notify_remote(record, reason).await;
        }
        true
    }

    /// Best effort: tells the record service and the other participant that
    /// this side is done with `record`.
    async fn notify_remote(&self, record: &CallRecord, reason: EndReason) {
        let other = match other_participant(record, &self.self_id) {
            Ok(other) => other.clone(),
            Err(e) => {
                warn!("Not notifying peer: {}", e);
                return;
            }
        };

        let (stored, event) = if reason == EndReason::LocalRejected {
            (
                self.records.reject(&record.id).await,
                SignalingEvent::rejected(record.id.clone(), other),
            )
        } else {
            (
                self.records.end(&record.id).await,
                SignalingEvent::ended(record.id.clone(), other),
            )
        };
        if let Err(e) = stored {
            warn!("Call record service did not store end of {}: {:#}", record.id, e);
        }
        if let Err(e) = self.signaling.emit(event).await {
            warn!("Could not notify peer about call {}: {:#}", record.id, e);
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
