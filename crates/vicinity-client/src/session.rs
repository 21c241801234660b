//! Chat session facade composing the connection, REST, capture, and
//! playback layers behind one handle.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vicinity_media::{
    AudioSink, PlaybackAction, PlaybackError, PlaybackManager, RecorderBackend, RecordingError,
    VoiceRecorder,
};
use vicinity_net::{
    spawn_connection, ApiError, ConnectionCommand, ConnectionConfig, ConnectionEvent, ProximityApi,
};
use vicinity_shared::protocol::ClientFrame;
use vicinity_shared::types::{
    ChatItem, Coordinates, Identity, NearbyUser, SessionStatus, VoiceMessage,
};
use vicinity_shared::VicinityError;

use crate::config::SessionConfig;
use crate::events::ChatEvent;
use crate::state::SessionState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] VicinityError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What happened to an outbound message.
///
/// Sends while the socket is down do not fail; they trigger a silent
/// reconnect and report that the message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Reconnecting,
}

/// One proximity chat session. Generic over the audio device seams so
/// tests run without hardware.
pub struct ChatSession<R: RecorderBackend, S: AudioSink> {
    config: SessionConfig,
    api: ProximityApi,
    state: Arc<Mutex<SessionState>>,
    recorder: VoiceRecorder<R>,
    playback: PlaybackManager<S>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<R: RecorderBackend, S: AudioSink> ChatSession<R, S> {
    /// The receiver carries every UI-relevant event for the session's life.
    pub fn new(
        config: SessionConfig,
        recorder_backend: R,
        sink: S,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let api = ProximityApi::new(config.server_url.clone());
        let (playback, mut finished_rx) = PlaybackManager::new(sink, config.server_url.clone());

        // Surface natural playback completions as session events.
        let finished_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(identity) = finished_rx.recv().await {
                let _ = finished_events
                    .send(ChatEvent::PlaybackFinished(identity))
                    .await;
            }
        });

        (
            Self {
                config,
                api,
                state: Arc::new(Mutex::new(SessionState::new())),
                recorder: VoiceRecorder::new(recorder_backend),
                playback,
                event_tx,
            },
            event_rx,
        )
    }

    /// Joins the chat at the given location.
    ///
    /// Saving the location and fetching the nearby snapshot are best-effort;
    /// their failures become notices and the socket is attempted regardless.
    pub async fn join(
        &mut self,
        identity: Identity,
        location: Coordinates,
    ) -> Result<(), SessionError> {
        if lock(&self.state).conn_cmd_tx.is_some() {
            return Err(VicinityError::Connection("session already joined".into()).into());
        }

        info!(user = %identity.user_id, "Joining local chat");
        {
            let mut state = lock(&self.state);
            state.identity = Some(identity.clone());
            state.location = Some(location);
        }

        if let Err(e) = self.api.save_location(&identity.user_id, location).await {
            warn!(error = %e, "Failed to save location");
            self.notice(format!("Could not update your location: {e}")).await;
        }
        match self
            .api
            .nearby_users(location, self.config.radius_m, &identity.user_id)
            .await
        {
            Ok(users) => {
                lock(&self.state).nearby = users.clone();
                let _ = self.event_tx.send(ChatEvent::NearbyUpdated(users)).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch nearby users");
                self.notice(format!("Could not load nearby users: {e}")).await;
            }
        }

        let mut conn = ConnectionConfig::new(self.config.server_url.clone(), identity, location);
        conn.radius_m = self.config.radius_m;
        conn.policy = self.config.policy.clone();
        conn.heartbeat_period = self.config.heartbeat_period;

        let (cmd_tx, conn_rx) = spawn_connection(conn);
        lock(&self.state).conn_cmd_tx = Some(cmd_tx);

        tokio::spawn(bridge(self.state.clone(), conn_rx, self.event_tx.clone()));
        Ok(())
    }

    /// Forces a new join handshake, optionally at a new location. Requires
    /// a prior join so a location is on record.
    pub async fn rejoin(&mut self, location: Option<Coordinates>) -> Result<(), SessionError> {
        let cmd_tx = {
            let mut state = lock(&self.state);
            if let Some(loc) = location {
                state.location = Some(loc);
            }
            if state.location.is_none() {
                return Err(VicinityError::MissingLocation.into());
            }
            state
                .conn_cmd_tx
                .clone()
                .ok_or(VicinityError::NotJoined)?
        };
        cmd_tx
            .send(ConnectionCommand::Rejoin { location })
            .await
            .map_err(|_| VicinityError::Connection("connection task gone".into()))?;
        Ok(())
    }

    /// Sends a text message. When the socket is down the message is not
    /// queued; a silent reconnect is kicked off instead.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<SendOutcome, SessionError> {
        let frame = {
            let state = lock(&self.state);
            let identity = state.identity.as_ref().ok_or(VicinityError::NotJoined)?;
            ClientFrame::Chat {
                user_id: identity.user_id.0.clone(),
                name: identity.name(),
                message: text.into(),
                timestamp: Utc::now(),
            }
        };
        self.dispatch(frame).await
    }

    /// Starts recording a voice message. The microphone is exclusive; a
    /// second start fails without touching the device.
    pub fn start_recording(&mut self) -> Result<(), SessionError> {
        self.recorder.start().map_err(Into::into)
    }

    /// Aborts any recording in progress. Safe to call when idle.
    pub fn cancel_recording(&mut self) {
        self.recorder.cancel();
    }

    /// Seconds elapsed in the current recording, if one is active.
    pub fn recording_elapsed(&self) -> Option<u32> {
        self.recorder.elapsed_secs()
    }

    /// Stops the recording and sends it as a voice frame. The temp artifact
    /// is deleted as soon as its bytes are read.
    pub async fn send_voice(&mut self) -> Result<SendOutcome, SessionError> {
        let artifact = self.recorder.stop()?;
        let duration = artifact.duration_secs;
        let payload = artifact.into_payload()?;

        let frame = {
            let state = lock(&self.state);
            let identity = state.identity.clone().ok_or(VicinityError::NotJoined)?;
            ClientFrame::Voice {
                user_id: identity.user_id.0.clone(),
                name: identity.name(),
                audio_data: payload.audio_base64,
                duration,
                timestamp: Utc::now(),
                mime_type: payload.mime,
            }
        };
        self.dispatch(frame).await
    }

    /// Tap-to-toggle playback of a voice message. Failures are recoverable:
    /// a notice is emitted and the session continues.
    pub async fn toggle_playback(
        &mut self,
        message: &VoiceMessage,
    ) -> Result<PlaybackAction, SessionError> {
        match self.playback.toggle(message).await {
            Ok(action) => Ok(action),
            Err(e) => {
                self.notice(format!("Could not play voice message: {e}")).await;
                Err(e.into())
            }
        }
    }

    /// Re-fetches the nearby snapshot and replaces the stored one.
    pub async fn refresh_nearby(&mut self) -> Result<Vec<NearbyUser>, SessionError> {
        let (user_id, location) = {
            let state = lock(&self.state);
            let identity = state.identity.clone().ok_or(VicinityError::NotJoined)?;
            let location = state.location.ok_or(VicinityError::MissingLocation)?;
            (identity.user_id, location)
        };
        let users = self
            .api
            .nearby_users(location, self.config.radius_m, &user_id)
            .await?;
        lock(&self.state).nearby = users.clone();
        let _ = self
            .event_tx
            .send(ChatEvent::NearbyUpdated(users.clone()))
            .await;
        Ok(users)
    }

    /// Leaves the chat: stops recording and playback, closes the socket
    /// cleanly, and cancels any pending retry. Idempotent.
    pub async fn leave(&mut self) {
        self.recorder.cancel();
        self.playback.stop();

        let cmd_tx = lock(&self.state).conn_cmd_tx.take();
        if let Some(cmd_tx) = cmd_tx {
            debug!("Leaving chat session");
            let _ = cmd_tx.send(ConnectionCommand::Stop).await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status
    }

    /// Snapshot of the ordered message log.
    pub fn messages(&self) -> Vec<ChatItem> {
        lock(&self.state).messages.clone()
    }

    /// Snapshot of the nearby users from the last refresh.
    pub fn nearby_users(&self) -> Vec<NearbyUser> {
        lock(&self.state).nearby.clone()
    }

    /// Sends a frame when Connected; otherwise drops it and nudges the
    /// connection task to rejoin at the last known location.
    async fn dispatch(&mut self, frame: ClientFrame) -> Result<SendOutcome, SessionError> {
        let (cmd_tx, connected, location) = {
            let state = lock(&self.state);
            let cmd_tx = state
                .conn_cmd_tx
                .clone()
                .ok_or(VicinityError::NotJoined)?;
            (cmd_tx, state.status.is_connected(), state.location)
        };

        if connected {
            cmd_tx
                .send(ConnectionCommand::SendFrame(frame))
                .await
                .map_err(|_| VicinityError::Connection("connection task gone".into()))?;
            Ok(SendOutcome::Sent)
        } else {
            debug!(kind = frame.kind(), "Socket down, requesting rejoin");
            let _ = cmd_tx.send(ConnectionCommand::Rejoin { location }).await;
            Ok(SendOutcome::Reconnecting)
        }
    }

    async fn notice(&self, text: String) {
        let _ = self.event_tx.send(ChatEvent::Notice { text }).await;
    }
}

/// Forwards connection events into the session: statuses update the shared
/// state, renderable messages are appended to the log exactly once. Ends
/// when the connection task terminates.
async fn bridge(
    state: Arc<Mutex<SessionState>>,
    mut conn_rx: mpsc::Receiver<ConnectionEvent>,
    event_tx: mpsc::Sender<ChatEvent>,
) {
    while let Some(event) = conn_rx.recv().await {
        match event {
            ConnectionEvent::StatusChanged(status) => {
                lock(&state).status = status;
                let _ = event_tx.send(ChatEvent::StatusChanged(status)).await;
            }
            ConnectionEvent::MessageReceived(item) => {
                lock(&state).messages.push(item.clone());
                let _ = event_tx.send(ChatEvent::MessageAppended(item)).await;
            }
        }
    }
    debug!("Connection bridge ended");
}

fn lock(state: &Arc<Mutex<SessionState>>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use vicinity_media::ResolvedSource;
    use vicinity_net::ReconnectPolicy;

    struct NullBackend;

    impl RecorderBackend for NullBackend {
        fn begin(&mut self) -> Result<(), RecordingError> {
            Ok(())
        }

        fn finalize(&mut self) -> Result<PathBuf, RecordingError> {
            let path = std::env::temp_dir()
                .join(format!("vicinity_session_test_{}.bin", std::process::id()));
            std::fs::write(&path, b"pcm").unwrap();
            Ok(path)
        }

        fn discard(&mut self) {}

        fn mime(&self) -> &str {
            "audio/webm"
        }
    }

    struct NullSink;

    impl AudioSink for NullSink {
        async fn start(
            &mut self,
            _source: &ResolvedSource,
            _done: oneshot::Sender<()>,
        ) -> Result<(), PlaybackError> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    fn session(server_url: &str) -> (ChatSession<NullBackend, NullSink>, mpsc::Receiver<ChatEvent>) {
        let mut config = SessionConfig::new(server_url);
        config.policy = ReconnectPolicy {
            base_ms: 5,
            cap_ms: 10,
            max_attempts: 2,
        };
        ChatSession::new(config, NullBackend, NullSink)
    }

    async fn next_status(rx: &mut mpsc::Receiver<ChatEvent>) -> SessionStatus {
        loop {
            match timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
            {
                ChatEvent::StatusChanged(status) => return status,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn operations_require_a_join() {
        let (mut session, _events) = session("http://127.0.0.1:9");

        assert!(matches!(
            session.send_text("hello").await,
            Err(SessionError::Core(VicinityError::NotJoined))
        ));
        assert!(matches!(
            session.rejoin(None).await,
            Err(SessionError::Core(VicinityError::MissingLocation))
        ));
        assert!(matches!(
            session.refresh_nearby().await,
            Err(SessionError::Core(VicinityError::NotJoined))
        ));
    }

    #[tokio::test]
    async fn recording_is_exclusive() {
        let (mut session, _events) = session("http://127.0.0.1:9");

        session.start_recording().unwrap();
        assert!(matches!(
            session.start_recording(),
            Err(SessionError::Recording(
                RecordingError::RecordingUnavailable
            ))
        ));

        session.cancel_recording();
        session.start_recording().unwrap();
        session.cancel_recording();
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_notices_and_retries_then_idles() {
        // Bind-then-drop guarantees nothing listens on the address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut session, mut events) = session(&format!("http://{addr}"));
        session
            .join(
                Identity::new("u1", "Test User"),
                Coordinates {
                    latitude: 37.77,
                    longitude: -122.41,
                },
            )
            .await
            .unwrap();

        // REST failures arrive as notices before any status event.
        let mut notices = 0;
        loop {
            match timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChatEvent::Notice { .. } => notices += 1,
                ChatEvent::StatusChanged(SessionStatus::Connecting) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(notices, 2);

        // One scheduled retry, then the second failure degrades to Idle.
        assert_eq!(next_status(&mut events).await, SessionStatus::Reconnecting);
        assert_eq!(next_status(&mut events).await, SessionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, SessionStatus::Idle);

        // A send while down is not delivered; it requests a rejoin.
        assert_eq!(
            session.send_text("anyone there?").await.unwrap(),
            SendOutcome::Reconnecting
        );

        // The rejoin kicks off another connect cycle before the stop lands.
        session.leave().await;
        while next_status(&mut events).await != SessionStatus::Closed {}
    }

    /// Answers one accepted connection: websocket upgrades are completed,
    /// anything else (the facade's REST calls) gets an empty 404.
    async fn serve(
        mut stream: tokio::net::TcpStream,
    ) -> Option<tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buf = [0u8; 1024];
        let n = stream.peek(&mut buf).await.unwrap();
        if buf[..n].starts_with(b"GET /ws/localchat") {
            return Some(tokio_tungstenite::accept_async(stream).await.unwrap());
        }
        let mut head = vec![0u8; n];
        stream.read_exact(&mut head).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        None
    }

    #[tokio::test]
    async fn connected_session_delivers_text_and_voice_frames() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let Some(mut ws) = serve(stream).await else {
                    continue;
                };

                let join = ws.next().await.unwrap().unwrap();
                let join: serde_json::Value =
                    serde_json::from_str(join.to_text().unwrap()).unwrap();
                assert_eq!(join["type"], "join");
                assert_eq!(join["userId"], "u1");

                ws.send(Message::Text(
                    r#"{"type":"chat","userId":"u2","name":"Ann","message":"hi","timestamp":"2024-01-01T00:00:00Z"}"#.into(),
                ))
                .await
                .unwrap();

                // Collect the client's chat and voice frames, skipping pings.
                let mut got_text = false;
                let voice = loop {
                    let Some(Ok(Message::Text(text))) = ws.next().await else {
                        panic!("socket ended before the voice frame");
                    };
                    let frame: serde_json::Value =
                        serde_json::from_str(text.as_str()).unwrap();
                    match frame["type"].as_str() {
                        Some("chat") => {
                            assert_eq!(frame["message"], "hello");
                            got_text = true;
                        }
                        Some("voice") => break frame,
                        _ => {}
                    }
                };
                assert!(got_text);
                assert!(voice["duration"].as_u64().unwrap() >= 1);
                assert!(!voice["audioData"].as_str().unwrap().is_empty());
                assert_eq!(voice["mimeType"], "audio/webm");
                return;
            }
        });

        let (mut session, mut events) = session(&format!("http://{addr}"));
        session
            .join(
                Identity::new("u1", "Test User"),
                Coordinates {
                    latitude: 37.77,
                    longitude: -122.41,
                },
            )
            .await
            .unwrap();
        while next_status(&mut events).await != SessionStatus::Connected {}

        assert_eq!(
            session.send_text("hello").await.unwrap(),
            SendOutcome::Sent
        );

        // The inbound chat frame lands in the log exactly once.
        loop {
            match timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChatEvent::MessageAppended(ChatItem::Text(msg)) => {
                    assert_eq!(msg.name, "Ann");
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(session.messages().len(), 1);

        session.start_recording().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(session.recording_elapsed().unwrap() >= 1);
        assert_eq!(session.send_voice().await.unwrap(), SendOutcome::Sent);

        server.await.unwrap();
        session.leave().await;
    }

    #[tokio::test]
    async fn join_twice_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let identity = Identity::new("u1", "Test User");
        let location = Coordinates {
            latitude: 0.0,
            longitude: 0.0,
        };

        let (mut session, _events) = session(&format!("http://{addr}"));
        session.join(identity.clone(), location).await.unwrap();
        assert!(matches!(
            session.join(identity, location).await,
            Err(SessionError::Core(VicinityError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut session, _events) = session(&format!("http://{addr}"));
        session
            .join(
                Identity::new("u1", "Test User"),
                Coordinates {
                    latitude: 0.0,
                    longitude: 0.0,
                },
            )
            .await
            .unwrap();

        session.leave().await;
        session.leave().await;

        // Leaving never poisons later local operations.
        assert!(session.recording_elapsed().is_none());
    }
}
