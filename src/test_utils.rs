use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use peercall_core::net::{HttpClient, HttpRequest, HttpResponse};
use peercall_core::{
    CallId, CallRecord, CallStatus, CallType, ConversationId, IceCandidate, SdpType,
    SessionDescription, SignalingEvent, SignalingTransport, UserId,
};
use tokio::sync::mpsc;

use crate::calls::media::{
    MediaAccessError, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind,
};
use crate::calls::peer::{
    NegotiationError, OfferOptions, PeerConnection, PeerConnectionState, PeerConnector, PeerEvent,
    RemoteTrack,
};
use crate::calls::records::{CallRecordService, OfferRequest};

/// Records every request and answers each with the same canned response.
#[derive(Debug)]
pub struct MockHttpClient {
    response: HttpResponse,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn with_response(response: HttpResponse) -> Self {
        Self {
            response,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(status_code: u16, body: &[u8]) -> Self {
        Self::with_response(HttpResponse {
            status_code,
            body: body.to_vec(),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::responding(200, b"{}")
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(self.response.clone())
    }
}

/// In-memory relay: delivers each event to the connection of its target user.
#[derive(Default)]
pub struct SignalingHub {
    clients: Mutex<HashMap<UserId, mpsc::Sender<SignalingEvent>>>,
    sent: Mutex<Vec<(UserId, SignalingEvent)>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn deliver(&self, event: SignalingEvent) {
        let Some(target) = event.target_user_id().cloned() else {
            return;
        };
        let tx = self.clients.lock().unwrap().get(&target).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Events a user sent through the relay, oldest first.
    pub fn sent_by(&self, user: &UserId) -> Vec<SignalingEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

pub struct FakeSignaling {
    user: UserId,
    hub: Arc<SignalingHub>,
    connected: AtomicBool,
}

impl FakeSignaling {
    pub fn new(hub: &Arc<SignalingHub>, user: &str) -> Arc<Self> {
        Arc::new(Self {
            user: UserId::new(user),
            hub: hub.clone(),
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SignalingTransport for FakeSignaling {
    async fn connect(&self, _credential: &str) -> Result<mpsc::Receiver<SignalingEvent>> {
        let (tx, rx) = mpsc::channel(100);
        self.hub
            .clients
            .lock()
            .unwrap()
            .insert(self.user.clone(), tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn emit(&self, event: SignalingEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("not connected"));
        }
        self.hub
            .sent
            .lock()
            .unwrap()
            .push((self.user.clone(), event.clone()));
        self.hub.deliver(event).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.clients.lock().unwrap().remove(&self.user);
    }
}

/// Shared backing store of the fake call record service.
pub struct CallRecordStore {
    hub: Arc<SignalingHub>,
    next_id: AtomicU64,
    conversations: Mutex<HashMap<ConversationId, (UserId, UserId)>>,
    records: Mutex<HashMap<CallId, CallRecord>>,
    log: Mutex<Vec<String>>,
    /// Held by tests to keep `create_offer` from completing.
    pub offer_gate: tokio::sync::Mutex<()>,
    offers_started: AtomicUsize,
    fail_offers: AtomicBool,
}

impl CallRecordStore {
    pub fn new(hub: &Arc<SignalingHub>) -> Arc<Self> {
        Arc::new(Self {
            hub: hub.clone(),
            next_id: AtomicU64::new(1),
            conversations: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            offer_gate: tokio::sync::Mutex::new(()),
            offers_started: AtomicUsize::new(0),
            fail_offers: AtomicBool::new(false),
        })
    }

    pub fn add_conversation(&self, id: &str, a: &str, b: &str) {
        self.conversations
            .lock()
            .unwrap()
            .insert(ConversationId::new(id), (UserId::new(a), UserId::new(b)));
    }

    /// Stores a record as if another client had created it.
    pub fn insert(&self, record: CallRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    /// `create_offer` calls that reached the service, gated or not.
    pub fn offers_started(&self) -> usize {
        self.offers_started.load(Ordering::SeqCst)
    }

    pub fn fail_offers(&self) {
        self.fail_offers.store(true, Ordering::SeqCst);
    }

    pub fn client(self: &Arc<Self>, user: &str) -> Arc<MemoryCallRecords> {
        Arc::new(MemoryCallRecords {
            user: UserId::new(user),
            store: self.clone(),
        })
    }

    /// Service calls in order, e.g. `"offer:call-1"`, `"end:call-1"`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn status(&self, id: &CallId) -> Option<CallStatus> {
        self.records.lock().unwrap().get(id).map(|r| r.status)
    }

    fn update(&self, op: &str, id: &CallId, status: CallStatus) -> Result<()> {
        self.log.lock().unwrap().push(format!("{op}:{id}"));
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow!("no call {id}"))?;
        record.status = status;
        Ok(())
    }
}

/// One user's view of the fake call record service.
pub struct MemoryCallRecords {
    user: UserId,
    store: Arc<CallRecordStore>,
}

#[async_trait]
impl CallRecordService for MemoryCallRecords {
    async fn create_offer(&self, request: &OfferRequest) -> Result<CallRecord> {
        self.store.offers_started.fetch_add(1, Ordering::SeqCst);
        let _gate = self.store.offer_gate.lock().await;
        if self.store.fail_offers.load(Ordering::SeqCst) {
            return Err(anyhow!("service unavailable"));
        }
        let (a, b) = self
            .store
            .conversations
            .lock()
            .unwrap()
            .get(&request.conversation_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown conversation"))?;
        let receiver = if a == self.user { b } else { a };

        let n = self.store.next_id.fetch_add(1, Ordering::SeqCst);
        let record = CallRecord {
            id: CallId::new(format!("call-{n}")),
            conversation_id: request.conversation_id.clone(),
            caller_id: self.user.clone(),
            receiver_id: receiver,
            call_type: request.call_type,
            offer: Some(request.offer.clone()),
            answer: None,
            status: CallStatus::Ringing,
        };
        self.store
            .log
            .lock()
            .unwrap()
            .push(format!("offer:{}", record.id));
        self.store
            .records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());

        self.store
            .hub
            .deliver(SignalingEvent::IncomingCall {
                call: record.clone(),
                target_user_id: None,
            })
            .await;
        Ok(record)
    }

    async fn answer(&self, call_id: &CallId, answer: &SessionDescription) -> Result<()> {
        self.store.update("answer", call_id, CallStatus::Answered)?;
        if let Some(record) = self.store.records.lock().unwrap().get_mut(call_id) {
            record.answer = Some(answer.clone());
        }
        Ok(())
    }

    async fn reject(&self, call_id: &CallId) -> Result<()> {
        self.store.update("reject", call_id, CallStatus::Rejected)
    }

    async fn end(&self, call_id: &CallId) -> Result<()> {
        self.store.update("end", call_id, CallStatus::Ended)
    }
}

/// Capture devices that hand out plain tracks and count what happens to them.
pub struct FakeDevices {
    deny: bool,
    camera: bool,
    next: AtomicUsize,
    opened: AtomicUsize,
    released: AtomicUsize,
    requested: Mutex<Vec<MediaConstraints>>,
}

impl FakeDevices {
    fn build(deny: bool, camera: bool) -> Self {
        Self {
            deny,
            camera,
            next: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn denying() -> Self {
        Self::build(true, true)
    }

    /// Opens audio only, even when video was asked for.
    pub fn without_camera() -> Self {
        Self::build(false, false)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<MediaConstraints> {
        self.requested.lock().unwrap().clone()
    }
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self::build(false, true)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaAccessError> {
        self.requested.lock().unwrap().push(*constraints);
        if self.deny {
            return Err(MediaAccessError::PermissionDenied);
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![MediaTrack::new(format!("mic-{n}"), TrackKind::Audio)];
        if constraints.wants_video() && self.camera {
            tracks.push(MediaTrack::new(format!("cam-{n}"), TrackKind::Video));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::new(format!("local-{n}"), tracks, *constraints))
    }

    fn on_released(&self, _stream: &MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

static NEXT_CONNECTION: AtomicUsize = AtomicUsize::new(1);

fn sections(description: &SessionDescription) -> Vec<TrackKind> {
    [TrackKind::Audio, TrackKind::Video]
        .into_iter()
        .filter(|k| description.has_media_section(&k.to_string()))
        .collect()
}

fn sdp(kinds: &[TrackKind]) -> String {
    let mut sdp = String::from("v=0\r\n");
    for kind in kinds {
        match kind {
            TrackKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
            TrackKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
        }
    }
    sdp
}

/// Connection that gathers one host candidate per local description and
/// reports `connected` as soon as both descriptions are set.
pub struct FakePeerConnection {
    id: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    local_kinds: Mutex<Vec<TrackKind>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
}

impl FakePeerConnection {
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn local_kinds(&self) -> Vec<TrackKind> {
        self.local_kinds.lock().unwrap().clone()
    }

    /// Simulates a state change reported by the network stack.
    pub fn report(&self, state: PeerConnectionState) {
        let _ = self.events.send(PeerEvent::ConnectionState(state));
    }

    fn maybe_connect(&self) {
        let remote = self.remote.lock().unwrap().clone();
        let local_set = self.local.lock().unwrap().is_some();
        let Some(remote) = remote.filter(|_| local_set) else {
            return;
        };
        self.report(PeerConnectionState::Connecting);
        for kind in sections(&remote) {
            let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{kind}-{}", self.id),
                stream_id: format!("remote-{}", self.id),
                kind,
                handle: None,
            }));
        }
        self.report(PeerConnectionState::Connected);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_local_track(&self, track: &MediaTrack) -> std::result::Result<(), NegotiationError> {
        self.local_kinds.lock().unwrap().push(track.kind());
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> std::result::Result<SessionDescription, NegotiationError> {
        let mut kinds = Vec::new();
        if options.audio {
            kinds.push(TrackKind::Audio);
        }
        if options.video {
            kinds.push(TrackKind::Video);
        }
        Ok(SessionDescription::offer(sdp(&kinds)))
    }

    async fn create_answer(&self) -> std::result::Result<SessionDescription, NegotiationError> {
        let remote = self.remote.lock().unwrap().clone();
        match remote {
            Some(offer) if offer.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(sdp(&sections(&offer))))
            }
            _ => Err(NegotiationError::OutOfOrder("answer without remote offer")),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> std::result::Result<(), NegotiationError> {
        *self.local.lock().unwrap() = Some(description);
        let candidate = IceCandidate::new(format!(
            "candidate:{id} 1 UDP 2130706431 192.0.2.{id} 5000 typ host",
            id = self.id
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0);
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> std::result::Result<(), NegotiationError> {
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidDescription("missing version line".into()));
        }
        *self.remote.lock().unwrap() = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> std::result::Result<(), NegotiationError> {
        if self.remote.lock().unwrap().is_none() {
            return Err(NegotiationError::OutOfOrder("candidate before remote description"));
        }
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), NegotiationError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerConnector {
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
}

impl FakePeerConnector {
    pub fn last(&self) -> Option<Arc<FakePeerConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> std::result::Result<Arc<dyn PeerConnection>, NegotiationError> {
        let connection = Arc::new(FakePeerConnection {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::SeqCst),
            events,
            local_kinds: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// A ringing record whose offer matches `call_type`.
pub fn ringing_record(id: &str, caller: &str, receiver: &str, call_type: CallType) -> CallRecord {
    CallRecord {
        id: CallId::new(id),
        conversation_id: ConversationId::new("conv-1"),
        caller_id: UserId::new(caller),
        receiver_id: UserId::new(receiver),
        call_type,
        offer: Some(SessionDescription::offer(sdp(&if call_type.has_video() {
            vec![TrackKind::Audio, TrackKind::Video]
        } else {
            vec![TrackKind::Audio]
        }))),
        answer: None,
        status: CallStatus::Ringing,
    }
}
