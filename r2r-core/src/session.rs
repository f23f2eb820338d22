//! Connection session: owns one peer stream, runs the handshake, decodes frames and dispatches envelopes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{Role, SessionConfig};
use crate::envelope::{Envelope, Header};
use crate::negotiation::{NegotiationError, Resolution, SharedNegotiator, Transition};
use crate::payload::{GenericPayload, Payload};
use crate::protocol::{unix_timestamp, versions_compatible, MessageType};
use crate::wire::{encode_frame_with_limit, FrameCodec, FrameDecodeError, FrameEncodeError};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives every envelope of one message type once the session is established.
pub trait Handler: Send {
    fn handle(&mut self, envelope: Envelope);
}

impl<F> Handler for F
where
    F: FnMut(Envelope) + Send,
{
    fn handle(&mut self, envelope: Envelope) {
        self(envelope)
    }
}

/// Non-fatal notifications for the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake completed; application traffic flows from here on.
    Handshaken { peer_id: String, version: String },
    /// A frame or action was dropped; the session continues.
    Warning(String),
    /// A negotiation reached a terminal state.
    Resolved(Resolution),
}

/// Errors that end a session, plus send-side failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("session closed")]
    Closed,
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolVersionMismatch { local: String, remote: String },
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("frame too large ({len} bytes, limit {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("too many consecutive frame errors ({0})")]
    TooManyFrameErrors(u32),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

struct Shared {
    agent_id: String,
    version: String,
    max_frame_len: usize,
    writer: Mutex<Option<Writer>>,
    shutdown: watch::Sender<bool>,
    last_timestamp: AtomicU64,
    peer_id: OnceLock<String>,
    negotiator: SharedNegotiator,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Cloneable handle for sending on, and closing, a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Write one complete frame as is. Concurrent sends are serialized; frames never interleave.
    /// Negotiation payloads sent this way bypass the negotiator; use [`Self::send_payload`].
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let frame = encode_frame_with_limit(envelope, self.shared.max_frame_len)?;
        self.write_frame(&frame).await
    }

    /// Wrap `payload` in a header from this agent and send it.
    ///
    /// A negotiation payload is checked against the negotiator first and refused if illegal
    /// or stale. It is applied only after the frame has been written, so a failed send
    /// leaves the negotiation untouched.
    pub async fn send_payload(
        &self,
        payload: impl Into<Payload>,
        target: Option<&str>,
    ) -> Result<(), SessionError> {
        let timestamp = self.next_timestamp();
        let mut header = Header::new(self.shared.agent_id.clone(), timestamp)
            .with_version(self.shared.version.clone());
        header.target_id = target.map(str::to_string);
        let envelope = Envelope::new(header, payload);
        let frame = encode_frame_with_limit(&envelope, self.shared.max_frame_len)?;
        let Payload::Negotiation(p) = &envelope.payload else {
            return self.write_frame(&frame).await;
        };

        // Held across the write so no other action on the task slips in between check and apply.
        let mut negotiator = self.shared.negotiator.lock().await;
        negotiator.check(p)?;
        self.write_frame(&frame).await?;
        let transition = negotiator.apply(&self.shared.agent_id, p, timestamp)?;
        drop(negotiator);
        if let Transition::Resolved(resolution) = transition {
            info!(
                task_id = %resolution.task_id,
                outcome = ?resolution.outcome,
                "negotiation resolved locally"
            );
            let _ = self.shared.events.send(SessionEvent::Resolved(resolution));
        }
        Ok(())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), SessionError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        tokio::select! {
            r = write => r.map_err(SessionError::from),
            _ = closed(&mut shutdown) => Err(SessionError::Closed),
        }
    }

    /// Close the session. Idempotent; wakes the read loop and any blocked send. The stream is never reopened.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            debug!(agent = %self.shared.agent_id, "shutting down writer");
            let _ = writer.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Peer's `source_id`, known once the handshake frame from the peer has arrived.
    pub fn peer_id(&self) -> Option<&str> {
        self.shared.peer_id.get().map(String::as_str)
    }

    pub fn negotiator(&self) -> &SharedNegotiator {
        &self.shared.negotiator
    }

    // Wall clock, clamped so timestamps never go backwards within the session.
    fn next_timestamp(&self) -> u64 {
        let now = unix_timestamp();
        let prev = self.shared.last_timestamp.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

/// One live peer connection. Build it, register handlers, then drive it with [`Session::run`].
pub struct Session {
    config: SessionConfig,
    reader: Reader,
    read_buf: Vec<u8>,
    codec: FrameCodec,
    handle: SessionHandle,
    handlers: HashMap<MessageType, Box<dyn Handler>>,
    shutdown: watch::Receiver<bool>,
    frame_errors: u32,
}

impl Session {
    pub fn new<R, W>(
        reader: R,
        writer: W,
        config: SessionConfig,
        negotiator: SharedNegotiator,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer: Writer = Box::new(writer);
        let shared = Arc::new(Shared {
            agent_id: config.agent_id.clone(),
            version: config.version.clone(),
            max_frame_len: config.max_frame_len,
            writer: Mutex::new(Some(writer)),
            shutdown: shutdown_tx,
            last_timestamp: AtomicU64::new(0),
            peer_id: OnceLock::new(),
            negotiator,
            events,
        });
        Self {
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
            codec: FrameCodec::with_limit(config.max_frame_len),
            config,
            reader: Box::new(reader),
            handle: SessionHandle { shared },
            handlers: HashMap::new(),
            shutdown: shutdown_rx,
            frame_errors: 0,
        }
    }

    /// Split a duplex stream (e.g. a `TcpStream`) into the session's halves.
    pub fn from_stream<S>(
        stream: S,
        config: SessionConfig,
        negotiator: SharedNegotiator,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, config, negotiator, events)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Register the handler for `ty`, replacing any earlier one.
    pub fn on(&mut self, ty: MessageType, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(ty, Box::new(handler));
        self
    }

    /// Run the handshake and then the read loop until the session ends.
    ///
    /// Returns `Ok(())` after a local [`SessionHandle::close`], otherwise the fatal error.
    /// The stream is closed before this returns.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        self.handle.close().await;
        let peer = self.handle.peer_id().unwrap_or("?").to_string();
        match &result {
            Ok(()) => info!(peer = %peer, "session closed"),
            Err(e) => error!(peer = %peer, error = %e, "session failed"),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let limit = self.config.handshake_timeout;
        let established = tokio::time::timeout(limit, self.handshake())
            .await
            .map_err(|_| SessionError::HandshakeTimeout(limit))??;
        let Some((peer_id, version)) = established else {
            return Ok(());
        };
        info!(peer = %peer_id, version = %version, "handshake complete");
        self.emit(SessionEvent::Handshaken { peer_id, version });

        while let Some(envelope) = self.next_envelope().await? {
            self.dispatch(envelope).await;
        }
        Ok(())
    }

    // Ok(None) when closed locally before the handshake finished.
    async fn handshake(&mut self) -> Result<Option<(String, String)>, SessionError> {
        let local = self.config.version.clone();
        if self.config.role == Role::Initiator {
            let hello = GenericPayload::default()
                .with("agent_id", self.config.agent_id.clone())
                .with("supported_versions", vec![local.clone()]);
            self.handle.send_payload(Payload::Handshake(hello), None).await?;
        }
        loop {
            let Some(envelope) = self.next_envelope().await? else {
                return Ok(None);
            };
            let source = envelope.header.source_id.clone();
            let remote = envelope.header.version.clone();
            match (self.config.role, &envelope.payload) {
                (Role::Acceptor, Payload::Handshake(_)) => {
                    self.set_peer(&source);
                    if !versions_compatible(&local, &remote) {
                        let refusal = GenericPayload::default()
                            .with("code", "version_mismatch")
                            .with("message", format!("unsupported protocol version {remote}"))
                            .with("supported_versions", vec![local.clone()]);
                        let _ = self
                            .handle
                            .send_payload(Payload::Error(refusal), Some(&source))
                            .await;
                        return Err(SessionError::ProtocolVersionMismatch { local, remote });
                    }
                    let ack = GenericPayload::default()
                        .with("agent_id", self.config.agent_id.clone())
                        .with("version", local.clone());
                    self.handle
                        .send_payload(Payload::HandshakeAck(ack), Some(&source))
                        .await?;
                    return Ok(Some((source, local)));
                }
                (Role::Initiator, Payload::HandshakeAck(ack)) => {
                    self.set_peer(&source);
                    let agreed = ack.get_str("version").unwrap_or(remote.as_str()).to_string();
                    if !versions_compatible(&local, &agreed) {
                        return Err(SessionError::ProtocolVersionMismatch {
                            local,
                            remote: agreed,
                        });
                    }
                    return Ok(Some((source, agreed)));
                }
                (Role::Initiator, Payload::Error(e)) => {
                    if e.get_str("code") == Some("version_mismatch") {
                        return Err(SessionError::ProtocolVersionMismatch { local, remote });
                    }
                    let message = e.get_str("message").unwrap_or("peer refused handshake");
                    return Err(SessionError::HandshakeFailed(message.to_string()));
                }
                _ => self.warning(format!(
                    "{} from {} before handshake completed; dropped",
                    envelope.message_type(),
                    source
                )),
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let ty = envelope.message_type();
        debug!(peer = %envelope.header.source_id, kind = %ty, "frame received");
        match &envelope.payload {
            Payload::Handshake(_) | Payload::HandshakeAck(_) => {
                self.warning(format!("unexpected {ty} after handshake; dropped"));
                return;
            }
            Payload::Negotiation(p) => {
                let applied = self.handle.shared.negotiator.lock().await.apply(
                    &envelope.header.source_id,
                    p,
                    unix_timestamp(),
                );
                match applied {
                    Ok(Transition::Resolved(resolution)) => {
                        info!(task_id = %resolution.task_id, outcome = ?resolution.outcome, "negotiation resolved");
                        self.emit(SessionEvent::Resolved(resolution));
                    }
                    Ok(Transition::Updated { task_id, state, offers }) => {
                        debug!(task_id = %task_id, state = ?state, offers, "negotiation updated");
                    }
                    Err(e) => {
                        self.warning(e.to_string());
                        return;
                    }
                }
            }
            Payload::Error(e) => {
                warn!(peer = %envelope.header.source_id, code = ?e.get_str("code"), "peer reported error");
            }
            _ => {}
        }
        match self.handlers.get_mut(&ty) {
            Some(handler) => handler.handle(envelope),
            None => debug!(kind = %ty, "no handler registered"),
        }
    }

    // Next decodable envelope in arrival order; Ok(None) once closed locally.
    async fn next_envelope(&mut self) -> Result<Option<Envelope>, SessionError> {
        loop {
            match self.codec.decode_next() {
                Ok(envelope) => {
                    self.frame_errors = 0;
                    return Ok(Some(envelope));
                }
                Err(FrameDecodeError::NeedMore) => {
                    if !self.fill().await? {
                        return Ok(None);
                    }
                }
                Err(FrameDecodeError::EmptyLine) => {}
                Err(FrameDecodeError::TooLarge { len, max }) => {
                    return Err(SessionError::FrameTooLarge { len, max });
                }
                Err(e) => {
                    self.frame_errors += 1;
                    self.warning(format!("dropped frame: {e}"));
                    if self.frame_errors > self.config.max_frame_errors {
                        return Err(SessionError::TooManyFrameErrors(self.frame_errors));
                    }
                }
            }
        }
    }

    // Read once into the codec. Ok(false) when closed locally.
    async fn fill(&mut self) -> Result<bool, SessionError> {
        let n = tokio::select! {
            _ = closed(&mut self.shutdown) => return Ok(false),
            r = self.reader.read(&mut self.read_buf) => r?,
        };
        if n == 0 {
            return Err(SessionError::ConnectionClosed);
        }
        self.codec.feed(&self.read_buf[..n]);
        match self.codec.check_limit() {
            Err(FrameDecodeError::TooLarge { len, max }) => {
                Err(SessionError::FrameTooLarge { len, max })
            }
            _ => Ok(true),
        }
    }

    fn set_peer(&self, peer_id: &str) {
        let _ = self.handle.shared.peer_id.set(peer_id.to_string());
    }

    fn warning(&self, message: String) {
        warn!(peer = self.handle.peer_id().unwrap_or("?"), "{}", message);
        self.emit(SessionEvent::Warning(message));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.handle.shared.events.send(event);
    }
}

// Resolves once the shutdown flag is set (or its sender is gone).
async fn closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{NegotiationState, Negotiator, Outcome};
    use crate::payload::{NegotiationAction, NegotiationPayload, StatusPayload};
    use crate::wire::{decode_frame, encode_frame};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    type Events = mpsc::UnboundedReceiver<SessionEvent>;

    fn negotiator() -> SharedNegotiator {
        Negotiator::shared(Duration::from_secs(60))
    }

    fn session(
        stream: DuplexStream,
        id: &str,
        role: Role,
        negotiator: SharedNegotiator,
    ) -> (Session, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig::new(id, role);
        (Session::from_stream(stream, config, negotiator, tx), rx)
    }

    /// The far end of a duplex pipe, speaking raw frames.
    struct RawPeer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawPeer {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                lines: BufReader::new(r).lines(),
                writer: w,
            }
        }

        async fn write_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn send(&mut self, source: &str, version: &str, payload: impl Into<Payload>) {
            let env = Envelope::new(Header::new(source, 1).with_version(version), payload);
            self.write_raw(&encode_frame(&env).unwrap()).await;
        }

        async fn recv(&mut self) -> Envelope {
            let line = self.lines.next_line().await.unwrap().unwrap();
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            decode_frame(&bytes).unwrap().0
        }

        async fn handshake(&mut self, source: &str) {
            self.send(source, "1.0", Payload::Handshake(GenericPayload::default()))
                .await;
            let ack = self.recv().await;
            assert_eq!(ack.message_type(), MessageType::HandshakeAck);
        }
    }

    fn collect(ty: MessageType, s: &mut Session) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        s.on(ty, move |env: Envelope| {
            let _ = tx.send(env);
        });
        rx
    }

    fn bid(task: &str, cost: i64) -> NegotiationPayload {
        NegotiationPayload::new(task, NegotiationAction::Bid).with_detail("cost", cost)
    }

    #[tokio::test]
    async fn handshake_then_status_dispatch() {
        let (a, b) = tokio::io::duplex(8192);
        let (client, mut client_events) = session(a, "robot_1", Role::Initiator, negotiator());
        let (mut server, mut server_events) = session(b, "robot_2", Role::Acceptor, negotiator());
        let mut statuses = collect(MessageType::Status, &mut server);
        let client_handle = client.handle();
        let client_task = tokio::spawn(client.run());
        let server_task = tokio::spawn(server.run());

        assert_eq!(
            client_events.recv().await.unwrap(),
            SessionEvent::Handshaken {
                peer_id: "robot_2".into(),
                version: "1.0".into()
            }
        );
        assert!(matches!(
            server_events.recv().await.unwrap(),
            SessionEvent::Handshaken { .. }
        ));
        assert_eq!(client_handle.peer_id(), Some("robot_2"));

        let status = StatusPayload::new("idle").with_detail("battery", 0.9);
        client_handle
            .send_payload(status.clone(), Some("robot_2"))
            .await
            .unwrap();
        let got = statuses.recv().await.unwrap();
        assert_eq!(got.payload, Payload::Status(status));
        assert_eq!(got.header.source_id, "robot_1");
        assert_eq!(got.header.target_id.as_deref(), Some("robot_2"));

        client_handle.close().await;
        client_handle.close().await;
        assert!(client_handle.is_closed());
        assert!(client_task.await.unwrap().is_ok());
        assert!(matches!(
            server_task.await.unwrap(),
            Err(SessionError::ConnectionClosed)
        ));
        assert!(matches!(
            client_handle
                .send_payload(StatusPayload::new("idle"), None)
                .await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal() {
        let (a, b) = tokio::io::duplex(8192);
        let (server, _events) = session(a, "robot_2", Role::Acceptor, negotiator());
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        peer.send("robot_1", "2.0", Payload::Handshake(GenericPayload::default()))
            .await;
        let refusal = peer.recv().await;
        let Payload::Error(body) = &refusal.payload else {
            panic!("expected error payload");
        };
        assert_eq!(body.get_str("code"), Some("version_mismatch"));
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::ProtocolVersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn initiator_rejects_incompatible_ack() {
        let (a, b) = tokio::io::duplex(8192);
        let (client, _events) = session(a, "robot_1", Role::Initiator, negotiator());
        let task = tokio::spawn(client.run());
        let mut peer = RawPeer::new(b);
        let hello = peer.recv().await;
        assert_eq!(hello.message_type(), MessageType::Handshake);
        assert_eq!(hello.header.version, "1.0");
        peer.send(
            "robot_2",
            "3.1",
            Payload::HandshakeAck(GenericPayload::default().with("version", "3.1")),
        )
        .await;
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::ProtocolVersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn nothing_dispatched_before_handshake() {
        let (a, b) = tokio::io::duplex(8192);
        let (mut server, mut events) = session(a, "robot_2", Role::Acceptor, negotiator());
        let mut statuses = collect(MessageType::Status, &mut server);
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);

        peer.send("robot_1", "1.0", StatusPayload::new("early")).await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Warning(_)));
        peer.handshake("robot_1").await;
        peer.send("robot_1", "1.0", StatusPayload::new("late")).await;

        let got = statuses.recv().await.unwrap();
        let Payload::Status(s) = got.payload else {
            panic!("expected status");
        };
        assert_eq!(s.status, "late");
        handle.close().await;
        assert!(task.await.unwrap().is_ok());
        assert!(statuses.try_recv().is_err());
    }

    #[tokio::test]
    async fn corrupt_lines_are_warnings() {
        let (a, b) = tokio::io::duplex(8192);
        let (mut server, mut events) = session(a, "robot_2", Role::Acceptor, negotiator());
        let mut statuses = collect(MessageType::Status, &mut server);
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        peer.handshake("robot_1").await;

        peer.send("robot_1", "1.0", StatusPayload::new("one")).await;
        peer.write_raw(b"{not json}\n\n").await;
        peer.send("robot_1", "1.0", StatusPayload::new("two")).await;

        for expected in ["one", "two"] {
            let Payload::Status(s) = statuses.recv().await.unwrap().payload else {
                panic!("expected status");
            };
            assert_eq!(s.status, expected);
        }
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Handshaken { .. }));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Warning(_)));
        handle.close().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn repeated_frame_errors_are_fatal() {
        let (a, b) = tokio::io::duplex(8192);
        let (tx, _events) = mpsc::unbounded_channel();
        let mut config = SessionConfig::new("robot_2", Role::Acceptor);
        config.max_frame_errors = 2;
        let server = Session::from_stream(a, config, negotiator(), tx);
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        peer.handshake("robot_1").await;
        peer.write_raw(b"x\ny\nz\n").await;
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::TooManyFrameErrors(3))
        ));
    }

    #[tokio::test]
    async fn oversized_undelimited_input_is_fatal() {
        let (a, b) = tokio::io::duplex(8192);
        let (tx, _events) = mpsc::unbounded_channel();
        let mut config = SessionConfig::new("robot_2", Role::Acceptor);
        config.max_frame_len = 64;
        let server = Session::from_stream(a, config, negotiator(), tx);
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        peer.write_raw(&[b'{'; 100]).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::FrameTooLarge { max: 64, .. })
        ));
    }

    #[tokio::test]
    async fn oversized_complete_line_is_fatal() {
        let (a, b) = tokio::io::duplex(8192);
        let (tx, _events) = mpsc::unbounded_channel();
        let mut config = SessionConfig::new("robot_2", Role::Acceptor);
        config.max_frame_len = 200;
        let server = Session::from_stream(a, config, negotiator(), tx);
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        let mut line = vec![b'x'; 300];
        line.push(b'\n');
        peer.write_raw(&line).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::FrameTooLarge { max: 200, .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        // A small pipe forces every large frame to be written in many pieces.
        let (a, b) = tokio::io::duplex(64);
        let (client, _events) = session(a, "robot_1", Role::Initiator, negotiator());
        let handle = client.handle();
        let mut peer = RawPeer::new(b);

        let letters = ['a', 'b', 'c', 'd', 'e', 'f', 'g', 'h'];
        let senders: Vec<_> = letters
            .iter()
            .map(|&c| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let blob: String = std::iter::repeat(c).take(20_000).collect();
                    let status = StatusPayload::new(c.to_string()).with_detail("blob", blob);
                    handle.send_payload(status, None).await
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in &letters {
            let Payload::Status(s) = peer.recv().await.payload else {
                panic!("expected status");
            };
            let blob = s.details["blob"].as_str().unwrap();
            assert_eq!(blob.len(), 20_000);
            assert!(blob.chars().all(|c| c.to_string() == s.status));
            seen.push(s.status);
        }
        for sender in senders {
            sender.await.unwrap().unwrap();
        }
        seen.sort();
        let expected: Vec<String> = letters.iter().map(|c| c.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn failed_negotiation_send_leaves_state_untouched() {
        let negotiator = negotiator();
        let (client, mut events) = session(
            tokio::io::duplex(8192).0,
            "robot_1",
            Role::Initiator,
            negotiator.clone(),
        );
        let handle = client.handle();
        handle.close().await;

        assert!(matches!(
            handle.send_payload(bid("T9", 5), None).await,
            Err(SessionError::Closed)
        ));
        assert_eq!(negotiator.lock().await.state("T9"), NegotiationState::Open);

        // An accept that never reaches the peer does not resolve the task.
        negotiator
            .lock()
            .await
            .apply("robot_2", &bid("T10", 7), 1)
            .unwrap();
        let accept = NegotiationPayload::new("T10", NegotiationAction::AcceptTask);
        assert!(handle.send_payload(accept, None).await.is_err());
        assert_eq!(negotiator.lock().await.state("T10"), NegotiationState::Proposed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_negotiation_is_not_recorded() {
        let negotiator = negotiator();
        let (b, _a) = tokio::io::duplex(8192);
        let (tx, _events) = mpsc::unbounded_channel();
        let mut config = SessionConfig::new("robot_1", Role::Initiator);
        config.max_frame_len = 256;
        let client = Session::from_stream(b, config, negotiator.clone(), tx);
        let handle = client.handle();

        let big = bid("T11", 5).with_detail("notes", "n".repeat(512));
        assert!(matches!(
            handle.send_payload(big, None).await,
            Err(SessionError::Encode(FrameEncodeError::TooLarge { max: 256, .. }))
        ));
        assert_eq!(negotiator.lock().await.state("T11"), NegotiationState::Open);

        handle.send_payload(bid("T11", 5), None).await.unwrap();
        assert_eq!(negotiator.lock().await.state("T11"), NegotiationState::Proposed);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (a, _b) = tokio::io::duplex(8192);
        let (tx, _events) = mpsc::unbounded_channel();
        let mut config = SessionConfig::new("robot_2", Role::Acceptor);
        config.handshake_timeout = Duration::from_secs(5);
        let server = Session::from_stream(a, config, negotiator(), tx);
        assert!(matches!(
            server.run().await,
            Err(SessionError::HandshakeTimeout(_))
        ));
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (a, _b) = tokio::io::duplex(8192);
        let (server, _events) = session(a, "robot_2", Role::Acceptor, negotiator());
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        tokio::task::yield_now().await;
        handle.close().await;
        assert!(task.await.unwrap().is_ok());
        handle.close().await;
    }

    #[tokio::test]
    async fn negotiation_routed_to_state_machine() {
        let (a, b) = tokio::io::duplex(8192);
        let negotiator = Negotiator::shared(Duration::from_secs(60));
        let (mut server, mut events) = session(a, "robot_1", Role::Acceptor, negotiator.clone());
        let mut negotiations = collect(MessageType::Negotiation, &mut server);
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        let mut peer = RawPeer::new(b);
        peer.handshake("robot_2").await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Handshaken { .. }));

        peer.send("robot_2", "1.0", bid("T002", 28)).await;
        peer.send("robot_3", "1.0", bid("T002", 25)).await;
        negotiations.recv().await.unwrap();
        negotiations.recv().await.unwrap();
        {
            let n = negotiator.lock().await;
            assert_eq!(n.state("T002"), NegotiationState::Proposed);
            assert_eq!(n.session("T002").unwrap().offers().count(), 2);
        }

        // This agent accepts the second bid.
        let accept = NegotiationPayload::new("T002", NegotiationAction::AcceptTask)
            .with_detail("offer_from", "robot_3");
        handle.send_payload(accept, Some("robot_3")).await.unwrap();
        let SessionEvent::Resolved(res) = events.recv().await.unwrap() else {
            panic!("expected resolution");
        };
        assert_eq!(res.outcome, Outcome::Accepted);
        assert_eq!(res.accepted_offer.unwrap().details["cost"], 25);
        let sent = peer.recv().await;
        assert_eq!(sent.message_type(), MessageType::Negotiation);

        // Late bids are stale: reported, not dispatched.
        peer.send("robot_4", "1.0", bid("T002", 20)).await;
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Warning(_)));
        assert_eq!(negotiator.lock().await.state("T002"), NegotiationState::Accepted);
        assert!(matches!(
            handle
                .send_payload(bid("T002", 1), None)
                .await,
            Err(SessionError::Negotiation(NegotiationError::StaleNegotiation { .. }))
        ));

        handle.close().await;
        assert!(task.await.unwrap().is_ok());
        assert!(negotiations.try_recv().is_err());
    }
}
