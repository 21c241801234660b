//! Chat socket lifecycle with tokio mpsc command/event pattern.
//!
//! The connection task owns the WebSocket exclusively; the rest of the
//! application talks to it through typed command and event channels. The
//! state machine itself is a plain struct with named transition methods so
//! the legal transition set stays enumerable and testable without sockets.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use vicinity_shared::constants::{CHAT_WS_PATH, DEFAULT_RADIUS_M, HEARTBEAT_SECS};
use vicinity_shared::protocol::{ClientFrame, ServerFrame};
use vicinity_shared::types::{ChatItem, Coordinates, Identity, SessionStatus};

use crate::backoff::ReconnectPolicy;
use crate::heartbeat::Heartbeat;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Send an outbound frame on the open socket.
    SendFrame(ClientFrame),
    /// Re-run the join handshake. A healthy socket is closed first so at
    /// most one socket exists at a time; an updated location replaces the
    /// one used at the original join.
    Rejoin { location: Option<Coordinates> },
    /// Close the socket cleanly and terminate the task.
    Stop,
}

/// Events sent *from* the connection task to the session.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChanged(SessionStatus),
    /// A renderable chat or voice message arrived, in receipt order.
    MessageReceived(ChatItem),
}

/// Configuration for spawning the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base HTTP(S) service URL; the WebSocket endpoint is derived from it.
    pub server_url: String,
    pub identity: Identity,
    pub location: Coordinates,
    pub radius_m: u32,
    pub policy: ReconnectPolicy,
    pub heartbeat_period: Duration,
}

impl ConnectionConfig {
    pub fn new(server_url: impl Into<String>, identity: Identity, location: Coordinates) -> Self {
        Self {
            server_url: server_url.into(),
            identity,
            location,
            radius_m: DEFAULT_RADIUS_M,
            policy: ReconnectPolicy::default(),
            heartbeat_period: Duration::from_secs(HEARTBEAT_SECS),
        }
    }
}

/// Resolves the chat WebSocket URL from the base service URL by protocol
/// substitution plus the fixed chat route.
pub fn chat_ws_url(base: &str) -> String {
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{}{}", ws_base.trim_end_matches('/'), CHAT_WS_PATH)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Outcome of an abnormal close.
#[derive(Debug, PartialEq, Eq)]
enum CloseOutcome {
    RetryAfter(Duration),
    GiveUp,
}

/// Connection state, separated from socket I/O.
#[derive(Debug)]
struct ConnState {
    status: SessionStatus,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ConnState {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: SessionStatus::Idle,
            attempts: 0,
            policy,
        }
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    fn on_start(&mut self) {
        self.status = SessionStatus::Connecting;
    }

    fn on_socket_open(&mut self) {
        self.status = SessionStatus::Joining;
    }

    /// Entering Connected always resets the retry counter.
    fn on_joined(&mut self) {
        self.attempts = 0;
        self.status = SessionStatus::Connected;
    }

    /// A clean close by either party never schedules a retry.
    fn on_clean_close(&mut self) {
        self.status = SessionStatus::Idle;
    }

    fn on_abnormal_close(&mut self) -> CloseOutcome {
        self.attempts += 1;
        match self.policy.next_delay(self.attempts) {
            Some(delay) => {
                self.status = SessionStatus::Reconnecting;
                CloseOutcome::RetryAfter(delay)
            }
            None => {
                self.status = SessionStatus::Idle;
                CloseOutcome::GiveUp
            }
        }
    }

    fn on_stop(&mut self) {
        self.status = SessionStatus::Closed;
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// Spawn the connection task.
///
/// Returns the command channel and the event channel. The task runs until a
/// `Stop` command arrives or every command sender is dropped.
pub fn spawn_connection(
    config: ConnectionConfig,
) -> (
    mpsc::Sender<ConnectionCommand>,
    mpsc::Receiver<ConnectionEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ConnectionCommand>(64);
    let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(256);

    tokio::spawn(run(config, cmd_rx, event_tx));

    (cmd_tx, event_rx)
}

/// How the connected phase ended.
#[derive(Debug, PartialEq, Eq)]
enum SocketDrop {
    Stop,
    Clean,
    Abnormal,
    Replace,
}

/// What to do after a failed connect or abnormal close.
enum AfterDrop {
    Retry,
    Shutdown,
}

async fn run(
    mut config: ConnectionConfig,
    mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut state = ConnState::new(config.policy.clone());
    let mut is_reconnect = false;

    loop {
        state.on_start();
        emit_status(&event_tx, state.status()).await;

        let url = chat_ws_url(&config.server_url);
        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(url = %url, error = %e, "Chat socket connect failed");
                match after_drop(&mut state, &mut cmd_rx, &mut config, &event_tx).await {
                    AfterDrop::Retry => {
                        is_reconnect = true;
                        continue;
                    }
                    AfterDrop::Shutdown => break,
                }
            }
        };

        info!(url = %url, reconnect = is_reconnect, "Chat socket connected");
        state.on_socket_open();
        emit_status(&event_tx, state.status()).await;

        let join = join_frame(&config, is_reconnect);
        if send_frame(&mut ws, &join).await.is_err() {
            match after_drop(&mut state, &mut cmd_rx, &mut config, &event_tx).await {
                AfterDrop::Retry => {
                    is_reconnect = true;
                    continue;
                }
                AfterDrop::Shutdown => break,
            }
        }

        state.on_joined();
        emit_status(&event_tx, state.status()).await;
        debug!("Join handshake sent, heartbeat armed");

        match connected_loop(&mut ws, &mut cmd_rx, &event_tx, &mut config).await {
            SocketDrop::Stop => break,
            SocketDrop::Replace => {
                is_reconnect = true;
            }
            SocketDrop::Clean => {
                info!("Chat socket closed cleanly by the server");
                state.on_clean_close();
                emit_status(&event_tx, state.status()).await;
                if !await_rejoin(&mut cmd_rx, &mut config).await {
                    break;
                }
                is_reconnect = true;
            }
            SocketDrop::Abnormal => {
                match after_drop(&mut state, &mut cmd_rx, &mut config, &event_tx).await {
                    AfterDrop::Retry => {
                        is_reconnect = true;
                    }
                    AfterDrop::Shutdown => break,
                }
            }
        }
    }

    state.on_stop();
    emit_status(&event_tx, state.status()).await;
    info!("Connection task terminated");
}

/// Handles an abnormal close: schedule a backoff retry, or degrade silently
/// to Idle once the attempt limit is reached and wait for a manual rejoin.
async fn after_drop(
    state: &mut ConnState,
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
    config: &mut ConnectionConfig,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> AfterDrop {
    match state.on_abnormal_close() {
        CloseOutcome::RetryAfter(delay) => {
            debug!(attempt = state.attempts, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            emit_status(event_tx, state.status()).await;
            if wait_for_retry(delay, cmd_rx, config).await {
                AfterDrop::Retry
            } else {
                AfterDrop::Shutdown
            }
        }
        CloseOutcome::GiveUp => {
            warn!(attempts = state.attempts, "Reconnect attempts exhausted, session idle");
            emit_status(event_tx, state.status()).await;
            if await_rejoin(cmd_rx, config).await {
                AfterDrop::Retry
            } else {
                AfterDrop::Shutdown
            }
        }
    }
}

/// Sleeps out the backoff delay. Returns false when a `Stop` arrives (the
/// pending retry timer is cancelled unconditionally); an explicit `Rejoin`
/// short-circuits the wait.
async fn wait_for_retry(
    delay: Duration,
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
    config: &mut ConnectionConfig,
) -> bool {
    let timer = tokio::time::sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::Rejoin { location }) => {
                    if let Some(loc) = location {
                        config.location = loc;
                    }
                    return true;
                }
                Some(ConnectionCommand::SendFrame(frame)) => {
                    debug!(kind = frame.kind(), "Dropping send while reconnecting");
                }
                Some(ConnectionCommand::Stop) | None => return false,
            }
        }
    }
}

/// Parks the task after a give-up or clean close, waiting for an explicit
/// rejoin. Returns false on `Stop` or when all senders are gone.
async fn await_rejoin(
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
    config: &mut ConnectionConfig,
) -> bool {
    loop {
        match cmd_rx.recv().await {
            Some(ConnectionCommand::Rejoin { location }) => {
                if let Some(loc) = location {
                    config.location = loc;
                }
                return true;
            }
            Some(ConnectionCommand::SendFrame(frame)) => {
                debug!(kind = frame.kind(), "Dropping send while un-joined");
            }
            Some(ConnectionCommand::Stop) | None => return false,
        }
    }
}

/// Services the open socket until it drops or a command ends the phase.
/// The heartbeat lives on this stack frame, so leaving Connected for any
/// reason stops it immediately.
async fn connected_loop(
    ws: &mut WsStream,
    cmd_rx: &mut mpsc::Receiver<ConnectionCommand>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    config: &mut ConnectionConfig,
) -> SocketDrop {
    let mut heartbeat = Heartbeat::start(config.heartbeat_period);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_frame(ws, &Heartbeat::frame()).await.is_err() {
                    return SocketDrop::Abnormal;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::SendFrame(frame)) => {
                    if send_frame(ws, &frame).await.is_err() {
                        return SocketDrop::Abnormal;
                    }
                }
                Some(ConnectionCommand::Rejoin { location }) => {
                    if let Some(loc) = location {
                        config.location = loc;
                    }
                    let _ = ws.close(None).await;
                    return SocketDrop::Replace;
                }
                Some(ConnectionCommand::Stop) | None => {
                    let _ = ws.close(None).await;
                    return SocketDrop::Stop;
                }
            },

            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(item) = decode_incoming(text.as_str()) {
                        if event_tx
                            .send(ConnectionEvent::MessageReceived(item))
                            .await
                            .is_err()
                        {
                            // Event receiver gone, nobody is listening.
                            return SocketDrop::Stop;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return if close_is_clean(frame.as_ref()) {
                        SocketDrop::Clean
                    } else {
                        SocketDrop::Abnormal
                    };
                }
                // Transport ping/pong/binary; tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Chat socket error");
                    return SocketDrop::Abnormal;
                }
                None => return SocketDrop::Abnormal,
            }
        }
    }
}

/// Decodes one inbound text frame. Administrative and malformed frames are
/// logged and dropped; only chat and voice frames become log entries.
fn decode_incoming(text: &str) -> Option<ChatItem> {
    let frame = match ServerFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Dropping malformed frame");
            return None;
        }
    };

    match frame {
        ServerFrame::System { message } => {
            debug!(%message, "System notice (not rendered)");
            None
        }
        ServerFrame::Pong => {
            trace!("Pong received");
            None
        }
        ServerFrame::Error { message } => {
            warn!(%message, "Server error frame");
            None
        }
        renderable => match renderable.into_item() {
            Ok(item) => item,
            Err(e) => {
                debug!(error = %e, "Dropping voice frame without audio source");
                None
            }
        },
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) -> Result<(), ()> {
    let json = match frame.to_json() {
        Ok(json) => json,
        Err(e) => {
            // Encoding our own frames cannot realistically fail; drop rather
            // than tear the socket down.
            warn!(error = %e, kind = frame.kind(), "Failed to encode outbound frame");
            return Ok(());
        }
    };
    ws.send(Message::Text(json.into())).await.map_err(|e| {
        warn!(error = %e, kind = frame.kind(), "Send failed");
    })
}

fn join_frame(config: &ConnectionConfig, reconnect: bool) -> ClientFrame {
    ClientFrame::Join {
        user_id: config.identity.user_id.0.clone(),
        name: config.identity.name(),
        latitude: config.location.latitude,
        longitude: config.location.longitude,
        radius: config.radius_m,
        reconnect,
    }
}

fn close_is_clean(frame: Option<&CloseFrame>) -> bool {
    matches!(
        frame.map(|f| f.code),
        Some(CloseCode::Normal) | Some(CloseCode::Away)
    )
}

async fn emit_status(event_tx: &mpsc::Sender<ConnectionEvent>, status: SessionStatus) {
    let _ = event_tx
        .send(ConnectionEvent::StatusChanged(status))
        .await;
}
