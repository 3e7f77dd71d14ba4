//! Tokio-based signaling transport for peercall.
//!
//! Implements [`SignalingTransport`] over one authenticated WebSocket using
//! `tokio-tungstenite`. Every event travels as one JSON text frame
//! (`{"event": ..., "data": ...}`).

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use peercall_core::{SignalingEvent, SignalingTransport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Decodes one text frame. Frames that are not a known event yield `None`.
pub fn decode_event(text: &str) -> Option<SignalingEvent> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping undecodable signaling frame: {}", e);
            None
        }
    }
}

pub fn encode_event(event: &SignalingEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// WebSocket connection to the signaling relay.
pub struct TokioSignalingTransport {
    url: String,
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    is_connected: Arc<AtomicBool>,
    read_pump: Mutex<Option<JoinHandle<()>>>,
}

impl TokioSignalingTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ws_sink: Arc::new(Mutex::new(None)),
            is_connected: Arc::new(AtomicBool::new(false)),
            read_pump: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SignalingTransport for TokioSignalingTransport {
    async fn connect(&self, credential: &str) -> Result<mpsc::Receiver<SignalingEvent>> {
        if self.is_connected() {
            debug!("Reconnecting, closing the previous connection first");
            self.disconnect().await;
        }

        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|_| anyhow!("credential is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        info!("Dialing {}", self.url);
        let (client, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow!("WebSocket connect failed: {}", e))?;
        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.ws_sink.lock().await = Some(sink);
        self.is_connected.store(true, Ordering::Release);

        let pump = tokio::task::spawn(read_pump(stream, event_tx, self.is_connected.clone()));
        *self.read_pump.lock().await = Some(pump);

        info!("Signaling connected");
        Ok(event_rx)
    }

    async fn emit(&self, event: SignalingEvent) -> Result<()> {
        let text = encode_event(&event)?;
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow!("Socket is closed"))?;

        debug!("--> {} for call {}", event.name(), event.call_id());
        sink.send(Message::text(text))
            .await
            .map_err(|e| anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    async fn disconnect(&self) {
        self.is_connected.store(false, Ordering::Release);
        if let Some(mut sink) = self.ws_sink.lock().await.take()
            && let Err(e) = sink.close().await
        {
            debug!("Error closing websocket: {}", e);
        }
        if let Some(pump) = self.read_pump.lock().await.take() {
            pump.abort();
        }
    }
}

async fn read_pump(
    mut stream: WsStream,
    event_tx: mpsc::Sender<SignalingEvent>,
    is_connected: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let Some(event) = decode_event(text.as_str()) else {
                    continue;
                };
                debug!("<-- {} for call {}", event.name(), event.call_id());
                if event_tx.send(event).await.is_err() {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                trace!("Received close frame");
                break;
            }
            Some(Ok(other)) => {
                trace!("Ignoring non-text frame ({} bytes)", other.len());
            }
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    is_connected.store(false, Ordering::Release);
    info!("Signaling disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use peercall_core::{CallId, UserId};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn test_garbage_frames_are_skipped() {
        assert!(decode_event("not json").is_none());
        assert!(decode_event(r#"{"event":"call-held","data":{"callId":"c1"}}"#).is_none());
        let event = decode_event(r#"{"event":"call-rejected","data":{"callId":"c1"}}"#).unwrap();
        assert_eq!(event.call_id(), &CallId::new("c1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_trip_against_local_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_auth = Arc::new(std::sync::Mutex::new(None::<String>));
        let seen = seen_auth.clone();

        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback).await.unwrap();
            ws.send(Message::text("garbage")).await.unwrap();
            ws.send(Message::text(r#"{"event":"call-ended","data":{"callId":"c7"}}"#))
                .await
                .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            reply.into_text().unwrap().as_str().to_owned()
        });

        let transport = TokioSignalingTransport::new(format!("ws://{addr}"));
        let mut rx = transport.connect("secret").await.unwrap();
        assert!(transport.is_connected());

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.call_id(), &CallId::new("c7"));

        transport
            .emit(SignalingEvent::rejected(CallId::new("c7"), UserId::new("alice")))
            .await
            .unwrap();
        let reply = relay.await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(json["event"], "call-rejected");
        assert_eq!(json["data"]["targetUserId"], "alice");
        assert_eq!(seen_auth.lock().unwrap().as_deref(), Some("Bearer secret"));

        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert!(transport.emit(SignalingEvent::ended(CallId::new("c7"), UserId::new("alice"))).await.is_err());
    }
}
