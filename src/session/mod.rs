//! Gateway session - connection lifecycle and frame dispatch
//!
//! Owns the single WebSocket connection to the gateway: dialling, the
//! challenge/connect handshake, reconnect with bounded exponential backoff,
//! and routing of inbound frames to the request correlator and the run
//! registry. Inbound frames are processed strictly in arrival order; per-run
//! delivery is decoupled through the registry's channels so a slow HTTP
//! consumer never stalls the read loop.

mod correlator;
mod runs;

pub use runs::RunStream;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    events, methods, ChatSendAck, ChatSendParams, ConnectParams, GatewayFrame, HelloPayload,
    RequestFrame, CONNECT_REQUEST_ID,
};

use correlator::Correlator;
use runs::RunRegistry;

/// Write half of the gateway socket
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Interval between TCP probes while waiting for the gateway to come up
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connection readiness as observed by [`GatewaySession::wait_ready`]
#[derive(Debug, Clone)]
enum ReadyState {
    /// Handshake not finished yet
    Pending,
    /// Handshake complete; holds the negotiated session key
    Ready(String),
    /// The session is closed and will never become ready
    Failed(SessionFailure),
}

/// Cloneable failure record for readiness waiters
#[derive(Debug, Clone)]
enum SessionFailure {
    Handshake(String),
    Transport(String),
}

impl SessionFailure {
    fn to_error(&self) -> Error {
        match self {
            SessionFailure::Handshake(m) => Error::Handshake(m.clone()),
            SessionFailure::Transport(m) => Error::Transport(m.clone()),
        }
    }
}

/// Handshake phase of one established connection. Dialling happens before a
/// phase exists; reconnect and close are decisions of the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingChallenge,
    Handshaking,
    Ready,
}

/// Why an established connection ended
enum Disconnect {
    /// close() was requested
    Shutdown,
    /// The gateway rejected the connect request; fatal, no reconnect
    HandshakeRejected(String),
    /// Transport closed or errored; candidate for reconnect
    Lost(String),
}

struct Shared {
    config: GatewayConfig,
    correlator: Correlator,
    runs: RunRegistry,
    /// Write half of the live connection; None while disconnected
    writer: AsyncMutex<Option<WsSink>>,
    ready_tx: watch::Sender<ReadyState>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to the process-wide gateway session.
///
/// Cheap to clone; all clones share one connection, one pending-request
/// table, and one run registry.
#[derive(Clone)]
pub struct GatewaySession {
    shared: Arc<Shared>,
}

impl GatewaySession {
    /// Spawn the session's connection task and return the shared handle
    pub fn spawn(config: GatewayConfig) -> Self {
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            correlator: Correlator::new(),
            runs: RunRegistry::new(),
            writer: AsyncMutex::new(None),
            ready_tx,
            shutdown_tx,
        });
        let task_shared = shared.clone();
        tokio::spawn(async move { connection_loop(task_shared).await });
        GatewaySession { shared }
    }

    /// Wait until the handshake completes; resolves with the session key.
    ///
    /// Single-resolution: waiters before readiness all observe the same
    /// outcome, callers after readiness return immediately.
    pub async fn wait_ready(&self) -> Result<String> {
        let mut rx = self.shared.ready_tx.subscribe();
        loop {
            match &*rx.borrow() {
                ReadyState::Ready(key) => return Ok(key.clone()),
                ReadyState::Failed(failure) => return Err(failure.to_error()),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Transport("session task ended".to_string()));
            }
        }
    }

    /// Send a correlated request and await its response payload
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.shared.correlator.next_id();
        self.request_with_id(&id, method, params).await
    }

    async fn request_with_id(&self, id: &str, method: &str, params: Value) -> Result<Value> {
        let frame = GatewayFrame::Request(RequestFrame::new(id, method, params));
        let text = frame.to_text()?;
        debug!("Sending request {} ({})", id, method);
        let rx = self.shared.correlator.register(id);
        if let Err(err) = send_text(&self.shared, text).await {
            self.shared.correlator.deregister(id);
            return Err(err);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Start a chat run on the negotiated session and return its delta stream
    pub async fn send_message(&self, message: &str) -> Result<RunStream> {
        let session_key = self.wait_ready().await?;
        let params = ChatSendParams {
            session_key,
            message: message.to_string(),
            idempotency_key: Uuid::new_v4().to_string(),
        };
        let id = self.shared.correlator.next_id();
        // Claim the run's channel before the request goes out; the read
        // loop binds it to the run id while it processes the ack. A claim
        // dropped on any failure path below withdraws itself.
        let claim = self.shared.runs.claim(&id);
        let payload = self
            .request_with_id(&id, methods::CHAT_SEND, serde_json::to_value(&params)?)
            .await?;
        let ack: ChatSendAck = serde_json::from_value(payload).unwrap_or_default();
        let Some(run_id) = ack.run_id else {
            return Err(Error::RequestFailed(
                "No runId in chat.send response".to_string(),
            ));
        };
        debug!("Run {} started", run_id);
        Ok(claim.into_stream(run_id))
    }

    /// Request session shutdown; idempotent
    pub fn close(&self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

/// Transmit one text frame over the live connection
async fn send_text(shared: &Shared, text: String) -> Result<()> {
    let mut writer = shared.writer.lock().await;
    match writer.as_mut() {
        Some(sink) => {
            sink.send(Message::Text(text)).await?;
            Ok(())
        }
        None => Err(Error::Transport("WebSocket not connected".to_string())),
    }
}

/// Backoff before reconnect attempt number `attempt` (zero-based)
fn reconnect_delay(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Outer connection loop: dial, serve, decide between reconnect and close.
///
/// The reconnect budget is for the session's whole lifetime; a successful
/// handshake does not reset it.
async fn connection_loop(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect_and_serve(&shared, &mut shutdown_rx).await {
            Disconnect::Shutdown => {
                info!("Gateway session closed");
                break;
            }
            Disconnect::HandshakeRejected(message) => {
                error!("Gateway rejected connect: {}", message);
                fail_session(&shared, SessionFailure::Handshake(message));
                break;
            }
            Disconnect::Lost(reason) => {
                warn!("Gateway connection lost: {}", reason);
                // Outstanding work cannot complete across a reconnect
                shared.correlator.fail_all();
                shared.runs.fail_all();
                *shared.writer.lock().await = None;

                if attempt >= shared.config.reconnect_max_attempts {
                    error!("Max reconnection attempts reached");
                    fail_session(
                        &shared,
                        SessionFailure::Transport(format!(
                            "gateway unreachable after {} reconnect attempts: {}",
                            attempt, reason
                        )),
                    );
                    break;
                }
                let delay = reconnect_delay(shared.config.reconnect_base_secs, attempt);
                attempt += 1;
                info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay, attempt, shared.config.reconnect_max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    // Final teardown: nothing outstanding may be left dangling
    shared.correlator.fail_all();
    shared.runs.fail_all();
    *shared.writer.lock().await = None;
    let pending = matches!(&*shared.ready_tx.borrow(), ReadyState::Pending);
    if pending {
        fail_session(
            &shared,
            SessionFailure::Transport("session closed".to_string()),
        );
    }
}

// send_replace rather than send: the state must update even when no waiter
// is currently subscribed
fn fail_session(shared: &Shared, failure: SessionFailure) {
    shared.ready_tx.send_replace(ReadyState::Failed(failure));
}

/// Dial the gateway and serve one connection until it ends
async fn connect_and_serve(
    shared: &Arc<Shared>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Disconnect {
    debug!("Connecting to gateway at {}", shared.config.url);
    let ws = tokio::select! {
        result = connect_async(shared.config.url.as_str()) => match result {
            Ok((ws, _response)) => ws,
            Err(err) => return Disconnect::Lost(err.to_string()),
        },
        _ = shutdown_rx.changed() => return Disconnect::Shutdown,
    };
    info!("Connected to gateway, awaiting challenge");

    let (sink, mut stream) = ws.split();
    *shared.writer.lock().await = Some(sink);
    let mut phase = Phase::AwaitingChallenge;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if let Some(mut sink) = shared.writer.lock().await.take() {
                    let _ = sink.send(Message::Close(None)).await;
                }
                return Disconnect::Shutdown;
            }
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Disconnect::Lost(err.to_string()),
                    None => return Disconnect::Lost("connection closed".to_string()),
                };
                match message {
                    Message::Text(text) => {
                        if let Some(disconnect) = handle_frame(shared, &mut phase, &text).await {
                            return disconnect;
                        }
                    }
                    Message::Close(_) => return Disconnect::Lost("connection closed".to_string()),
                    // Ping/pong are answered by the transport layer
                    _ => {}
                }
            }
        }
    }
}

/// Send the connect request answering a challenge
async fn send_connect(shared: &Shared) -> Result<()> {
    let params = serde_json::to_value(ConnectParams::operator(
        shared.config.token.expose_secret().to_string(),
    ))?;
    let frame = GatewayFrame::Request(RequestFrame::new(
        CONNECT_REQUEST_ID,
        methods::CONNECT,
        params,
    ));
    send_text(shared, frame.to_text()?).await
}

/// Process one inbound text frame. Returns Some when the connection must end.
async fn handle_frame(shared: &Shared, phase: &mut Phase, text: &str) -> Option<Disconnect> {
    let frame = match GatewayFrame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("Dropping malformed gateway frame: {}", err);
            return None;
        }
    };

    match frame {
        GatewayFrame::Event(event) if event.event == events::CONNECT_CHALLENGE => {
            if *phase != Phase::AwaitingChallenge {
                warn!("connect.challenge in phase {:?}, ignoring", phase);
                return None;
            }
            debug!("Challenge received, sending connect request");
            if let Err(err) = send_connect(shared).await {
                return Some(Disconnect::Lost(err.to_string()));
            }
            *phase = Phase::Handshaking;
            None
        }
        GatewayFrame::Response(res) if res.id == CONNECT_REQUEST_ID => {
            if *phase != Phase::Handshaking {
                warn!("connect response in phase {:?}, ignoring", phase);
                return None;
            }
            if res.ok {
                let hello: HelloPayload = res
                    .payload
                    .clone()
                    .map(|v| serde_json::from_value(v).unwrap_or_default())
                    .unwrap_or_default();
                if !hello.is_hello_ok() {
                    warn!("Connect response without hello-ok payload, still handshaking");
                    return None;
                }
                let session_key = hello.session_key();
                info!("Gateway handshake complete, sessionKey: {}", session_key);
                shared.ready_tx.send_replace(ReadyState::Ready(session_key));
                *phase = Phase::Ready;
                None
            } else {
                let detail = res
                    .error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| {
                        serde_json::to_string(&res)
                            .unwrap_or_else(|_| "connect rejected".to_string())
                    });
                Some(Disconnect::HandshakeRejected(detail))
            }
        }
        GatewayFrame::Response(res) => {
            // Bind any claimed run before the ack resolves, so events right
            // behind the ack never observe the run as unknown
            if res.ok {
                let run_id = res
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("runId"))
                    .and_then(|v| v.as_str());
                if let Some(run_id) = run_id {
                    shared.runs.bind_claim(&res.id, run_id.to_string());
                }
            }
            shared.correlator.complete(&res);
            None
        }
        GatewayFrame::Event(event) if event.event == events::AGENT => {
            if !event.payload.is_null() {
                match serde_json::from_value(event.payload) {
                    Ok(payload) => shared.runs.on_agent_event(payload),
                    Err(err) => warn!("Dropping malformed agent event: {}", err),
                }
            }
            None
        }
        GatewayFrame::Event(event) if event.event == events::CHAT => {
            if !event.payload.is_null() {
                match serde_json::from_value(event.payload) {
                    Ok(payload) => shared.runs.on_chat_event(payload),
                    Err(err) => warn!("Dropping malformed chat event: {}", err),
                }
            }
            None
        }
        GatewayFrame::Event(event) => {
            debug!("Ignoring gateway event {}", event.event);
            None
        }
        GatewayFrame::Request(req) => {
            debug!("Ignoring inbound request {} from gateway", req.method);
            None
        }
    }
}

/// Poll a TCP connect to the gateway's ready port until it accepts or the
/// timeout elapses. The gateway signals readiness by listening at all.
pub async fn wait_for_gateway(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Timeout(format!(
                        "gateway {}:{} not ready after {:?}: {}",
                        host, port, timeout, err
                    )));
                }
                debug!("Gateway {}:{} not ready yet: {}", host, port, err);
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        }
    }
}
