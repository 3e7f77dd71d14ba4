use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peercall::calls::media::SampleTrackDevices;
use peercall::calls::peer::WebRtcConnector;
use peercall::calls::{CallEngine, CallEvent, EngineConfig, RestCallRecordService};
use peercall::{CallType, ConversationId, SignalingTransport, UserId};
use peercall_tokio_transport::TokioSignalingTransport;
use peercall_ureq_http_client::UreqHttpClient;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// Demo client: connects to the signaling relay, optionally places one call,
// and logs everything the engine reports until Ctrl-C.
//
// Usage:
//   cargo run -- --user-id alice --token T                  # wait for calls, log them
//   cargo run -- --user-id bob --token T --auto-answer      # answer every incoming call
//   cargo run -- --user-id alice --token T --call conv-1 --video

#[derive(Parser, Debug)]
#[command(name = "peercall", about = "Peer-to-peer call demo client")]
struct Args {
    /// WebSocket URL of the signaling relay.
    #[arg(long, env = "PEERCALL_SIGNALING_URL", default_value = "ws://127.0.0.1:8080/ws")]
    signaling_url: String,

    /// Base URL of the call record service.
    #[arg(long, env = "PEERCALL_API_URL", default_value = "http://127.0.0.1:8080/api")]
    api_url: String,

    /// Bearer credential for both the relay and the record service.
    #[arg(long, env = "PEERCALL_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long, env = "PEERCALL_USER_ID")]
    user_id: String,

    /// Answer incoming calls as soon as they ring.
    #[arg(long)]
    auto_answer: bool,

    /// Place a call in this conversation after connecting.
    #[arg(long, value_name = "CONVERSATION_ID")]
    call: Option<String>,

    /// Make the placed call a video call.
    #[arg(long)]
    video: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            return;
        }
    };

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let config = EngineConfig::default();
    let transport = Arc::new(TokioSignalingTransport::new(args.signaling_url.clone()));
    let records = Arc::new(RestCallRecordService::new(
        Arc::new(UreqHttpClient::new()),
        args.api_url.clone(),
        args.token.clone(),
    ));
    let connector = Arc::new(WebRtcConnector::new(config.ice_servers.clone()));

    let engine = CallEngine::new(
        UserId::new(args.user_id.clone()),
        config,
        transport.clone(),
        records,
        Arc::new(SampleTrackDevices::new()),
        connector,
    );
    let mut events = engine.subscribe();

    let signaling = match engine.connect(&args.token).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Could not reach the signaling relay: {}", e);
            return;
        }
    };
    info!("Connected as {}", engine.self_id());

    if let Some(conversation) = args.call.as_deref() {
        let call_type = if args.video {
            CallType::Video
        } else {
            CallType::Audio
        };
        match engine
            .start_call(ConversationId::new(conversation), call_type)
            .await
        {
            Ok(record) => info!("Ringing {} (call {})", record.receiver_id, record.id),
            Err(e) => error!("Call failed: {}", e),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => on_event(&engine, args.auto_answer, event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} call events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.end_call().await;
    transport.disconnect().await;
    signaling.abort();
}

fn on_event(engine: &Arc<CallEngine>, auto_answer: bool, event: CallEvent) {
    match event {
        CallEvent::StateChanged(phase) => info!("Call state: {}", phase.name()),
        CallEvent::IncomingCall(record) => {
            info!(
                "Incoming {} call {} from {}",
                record.call_type, record.id, record.caller_id
            );
            if auto_answer {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.answer_call(&record, record.call_type).await {
                        error!("Answer failed: {}", e);
                    }
                });
            }
        }
        CallEvent::RemoteStreamAttached(stream) => {
            info!("Remote media attached ({} tracks)", stream.tracks().len());
        }
        CallEvent::SignalingLost => warn!("Lost the signaling relay"),
        CallEvent::Ended { call_id, reason } => match call_id {
            Some(id) => info!("Call {} ended: {:?}", id, reason),
            None => info!("Call ended before it was placed: {:?}", reason),
        },
    }
}
