use std::path::PathBuf;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use xorlink_core::cipher::{self, SharedSecret};
use xorlink_core::error::SessionError;
use xorlink_core::file_transfer::{self, TransferOutcome};
use xorlink_core::key_agreement::server_handshake;
use xorlink_core::protocol::{
    CHAT_CONFIRMATION, CHAT_PAYLOAD_LEN, Command, DISCONNECT_NOTICE, FILE_FAILURE, FILE_SUCCESS,
    TOKEN_ACK, TOKEN_LEN, encode_ack, trim_nul,
};
use xorlink_core::transport::{Connection, ConnectionExt};

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Directory where uploaded files are written.
    pub receive_dir: PathBuf,
    /// Longest a single read or write may wait on the peer. `None` waits
    /// forever.
    pub io_timeout: Option<Duration>,
    /// Size of the fixed chat payload both ends exchange.
    pub chat_payload_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_dir: std::env::temp_dir().join("xorlink"),
            io_timeout: Some(Duration::from_secs(300)),
            chat_payload_len: CHAT_PAYLOAD_LEN,
        }
    }
}

/// Protocol state of a server session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Ready,
    Chat,
    FileSend,
    Terminated,
}

/// Events a session reports while it runs.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Key agreement finished; commands are being served.
    Connected,
    /// A chat message was decrypted.
    ChatReceived { text: String },
    /// An upload completed and was written to `path`.
    FileReceived { path: PathBuf, size_bytes: u64 },
    /// An upload did not complete. `path` is `None` when the destination
    /// could not be created; otherwise the partial file is left there.
    FileFailed {
        path: Option<PathBuf>,
        received: u64,
        declared: u64,
        reason: String,
    },
    /// A token outside the command set was acknowledged and ignored.
    UnknownCommand { token: String },
    /// The session ended on an error.
    Error { message: String },
    /// The connection has been closed. Always the last event.
    Finished,
}

/// Everything the engine hands a session besides the connection itself.
pub struct SessionContext {
    pub session_id: u64,
    /// Cancelled when the engine shuts down.
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<SessionEvent>,
}

/// Trait for handling accepted connections.
///
/// The engine calls [`handle`](SessionHandler::handle) for every inbound
/// connection on a worker of its pool. Implementations carry the actual
/// protocol logic.
///
/// Wrap shared state in the implementor itself; the engine clones an
/// `Arc<H>` for every submitted task.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, conn: C, ctx: SessionContext) -> impl Future<Output = ()> + Send;
}

/// Where a session draws its key-agreement randomness from.
#[derive(Clone, Copy, Debug)]
pub enum RngSource {
    /// Fresh OS entropy per session.
    Entropy,
    /// Deterministic: `seed` mixed with the session id.
    Seeded(u64),
}

impl RngSource {
    fn rng_for(self, session_id: u64) -> StdRng {
        match self {
            Self::Entropy => StdRng::from_entropy(),
            Self::Seeded(seed) => StdRng::seed_from_u64(seed ^ session_id),
        }
    }
}

/// Serves the chat / file upload protocol.
pub struct ChatSessionHandler {
    config: SessionConfig,
    rng: RngSource,
}

impl ChatSessionHandler {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            rng: RngSource::Entropy,
        }
    }

    /// Replaces the randomness source, e.g. with a fixed seed in tests.
    #[must_use]
    pub fn with_rng(mut self, rng: RngSource) -> Self {
        self.rng = rng;
        self
    }
}

impl<C: Connection> SessionHandler<C> for ChatSessionHandler {
    async fn handle(&self, conn: C, ctx: SessionContext) {
        let peer = conn.peer();
        let session_id = ctx.session_id;
        info!(session_id, peer = %peer, "Session started");

        let mut rng = self.rng.rng_for(session_id);
        let mut session = Session::new(conn, &self.config, &ctx);
        let result = session.run(&mut rng).await;

        match &result {
            Ok(()) => info!(session_id, peer = %peer, "Peer requested stop"),
            Err(e) if e.is_disconnect() => {
                info!(session_id, peer = %peer, "Connection closed by peer");
            }
            Err(SessionError::Cancelled) => info!(session_id, peer = %peer, "Session cancelled"),
            Err(e) => {
                warn!(session_id, peer = %peer, error = %e, "Session failed");
                let _ = ctx
                    .events
                    .send(SessionEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        session.close().await;
        let _ = ctx.events.send(SessionEvent::Finished).await;
    }
}

/// One live connection.
struct Session<'a, C: Connection> {
    conn: GuardedConnection<C>,
    config: &'a SessionConfig,
    ctx: &'a SessionContext,
    secret: SharedSecret,
    state: SessionState,
}

impl<'a, C: Connection> Session<'a, C> {
    fn new(conn: C, config: &'a SessionConfig, ctx: &'a SessionContext) -> Self {
        Self {
            conn: GuardedConnection {
                inner: conn,
                io_timeout: config.io_timeout,
                cancel: ctx.cancel.clone(),
            },
            config,
            ctx,
            secret: SharedSecret(0),
            state: SessionState::Handshake,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = self.ctx.session_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    async fn emit(&mut self, event: SessionEvent) {
        // The engine may already have stopped listening; events are best effort.
        let _ = self.ctx.events.send(event).await;
    }

    /// Runs the handshake and the command loop. `Ok(())` means the peer
    /// sent `STOP`.
    async fn run(&mut self, rng: &mut StdRng) -> Result<(), SessionError> {
        self.secret = server_handshake(&mut self.conn, rng).await?;
        debug!(session_id = self.ctx.session_id, secret = self.secret.0, "Shared secret derived");
        self.emit(SessionEvent::Connected).await;

        loop {
            self.transition(SessionState::Ready);

            let mut token = [0u8; TOKEN_LEN];
            self.conn.read_full(&mut token).await?;
            self.conn.send_all(&encode_ack(TOKEN_ACK)).await?;

            let command = Command::parse(&token);
            debug!(session_id = self.ctx.session_id, %command, "Command received");

            match command {
                Command::Chat => self.handle_chat().await?,
                Command::Send => self.handle_send().await?,
                Command::Stop => return Ok(()),
                Command::Unknown(_) => {
                    debug!(session_id = self.ctx.session_id, %command, "Ignoring unknown command");
                    self.emit(SessionEvent::UnknownCommand {
                        token: command.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    /// Receives one fixed-size encrypted chat payload and confirms it.
    async fn handle_chat(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Chat);

        let mut buf = vec![0u8; self.config.chat_payload_len];
        self.conn.read_full(&mut buf).await?;
        cipher::apply(&mut buf, self.secret);
        let text = String::from_utf8_lossy(trim_nul(&buf)).into_owned();

        info!(session_id = self.ctx.session_id, text = %text, "Chat message received");
        self.emit(SessionEvent::ChatReceived { text }).await;

        if self.ctx.cancel.is_cancelled() {
            // Tell the client not to expect anything further.
            let _ = self.conn.inner.write_all(&encode_ack(DISCONNECT_NOTICE)).await;
            return Err(SessionError::Cancelled);
        }
        self.conn.send_all(&encode_ack(CHAT_CONFIRMATION)).await
    }

    /// Receives one file upload and answers with a success or failure
    /// confirmation.
    async fn handle_send(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::FileSend);

        let header = file_transfer::read_header(&mut self.conn).await?;
        let name = file_transfer::output_file_name(&header.extension);
        info!(
            session_id = self.ctx.session_id,
            size = header.size,
            extension = %header.extension,
            "Receiving file"
        );

        let (path, outcome) =
            match file_transfer::create_unique(&self.config.receive_dir, &name).await {
                Ok((path, file)) => {
                    let mut writer = BufWriter::new(file);
                    let outcome = file_transfer::receive_file(
                        &mut self.conn,
                        self.secret,
                        &mut writer,
                        header.size,
                    )
                    .await;
                    (Some(path), outcome)
                }
                Err(e) => {
                    // Abandon the upload but consume its body so the next
                    // token lines up.
                    warn!(
                        session_id = self.ctx.session_id,
                        error = %e,
                        dir = %self.config.receive_dir.display(),
                        "Cannot open upload destination"
                    );
                    let mut outcome = file_transfer::receive_file(
                        &mut self.conn,
                        self.secret,
                        &mut tokio::io::sink(),
                        header.size,
                    )
                    .await;
                    outcome.write_error = Some(e);
                    (None, outcome)
                }
            };

        self.finish_transfer(path, outcome).await
    }

    async fn finish_transfer(
        &mut self,
        path: Option<PathBuf>,
        outcome: TransferOutcome,
    ) -> Result<(), SessionError> {
        if outcome.is_complete() {
            let path = path.unwrap_or_default();
            info!(
                session_id = self.ctx.session_id,
                path = %path.display(),
                bytes = outcome.received,
                "File received"
            );
            self.conn.send_all(&encode_ack(FILE_SUCCESS)).await?;
            self.emit(SessionEvent::FileReceived {
                path,
                size_bytes: outcome.received,
            })
            .await;
            return Ok(());
        }

        let reason = match (&outcome.disconnect, &outcome.write_error) {
            (Some(e), _) => e.to_string(),
            (None, Some(e)) => format!("write failed: {e}"),
            (None, None) => "size mismatch".to_string(),
        };
        warn!(
            session_id = self.ctx.session_id,
            received = outcome.received,
            declared = outcome.declared,
            reason = %reason,
            "File transfer incomplete"
        );

        // The peer may already be gone; the confirmation is best effort then.
        let sent = self.conn.send_all(&encode_ack(FILE_FAILURE)).await;
        self.emit(SessionEvent::FileFailed {
            path,
            received: outcome.received,
            declared: outcome.declared,
            reason,
        })
        .await;

        match outcome.disconnect {
            Some(e) => Err(e),
            None => sent,
        }
    }

    /// Closes the connection. Consumes the session so this happens once.
    async fn close(mut self) {
        self.transition(SessionState::Terminated);
        if let Err(e) = self.conn.inner.shutdown().await {
            debug!(session_id = self.ctx.session_id, error = %e, "Shutdown after session end failed");
        }
    }
}

/// Applies the session's idle timeout and cancellation to every I/O call
/// of the wrapped connection.
struct GuardedConnection<C> {
    inner: C,
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
}

async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Option<Duration>,
    io: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send,
{
    let timed = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, io)
                .await
                .unwrap_or_else(|_| Err(SessionError::Timeout.into())),
            None => io.await,
        }
    };
    tokio::select! {
        () = cancel.cancelled() => Err(SessionError::Cancelled.into()),
        res = timed => res,
    }
}

impl<C: Connection> Connection for GuardedConnection<C> {
    fn peer(&self) -> String {
        self.inner.peer()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move { guarded(&self.cancel, self.io_timeout, self.inner.read(buf)).await }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move { guarded(&self.cancel, self.io_timeout, self.inner.write_all(buf)).await }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        self.inner.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use xorlink_core::memory::MemoryConnection;
    use xorlink_core::protocol::{ACK_LEN, FileHeader, decode_ack};

    use super::*;
    use crate::client::{ChatReply, Client};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const SMALL_CHAT: usize = 256;

    struct Harness {
        client: Client<MemoryConnection>,
        events: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
        server: tokio::task::JoinHandle<()>,
    }

    async fn start(receive_dir: &Path, io_timeout: Option<Duration>) -> Harness {
        let (server_conn, client_conn) = MemoryConnection::pair(64 * 1024);
        let (events_tx, events) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handler = Arc::new(
            ChatSessionHandler::new(SessionConfig {
                receive_dir: receive_dir.to_path_buf(),
                io_timeout,
                chat_payload_len: SMALL_CHAT,
            })
            .with_rng(RngSource::Seeded(42)),
        );
        let ctx = SessionContext {
            session_id: 1,
            cancel: cancel.clone(),
            events: events_tx,
        };
        let server = tokio::spawn(async move { handler.handle(server_conn, ctx).await });

        let mut rng = StdRng::seed_from_u64(99);
        let client = tokio::time::timeout(TIMEOUT, Client::connect(client_conn, &mut rng))
            .await
            .unwrap()
            .unwrap()
            .with_chat_payload_len(SMALL_CHAT);
        Harness {
            client,
            events,
            cancel,
            server,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_finished(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let ev = next_event(rx).await;
            let done = matches!(ev, SessionEvent::Finished);
            seen.push(ev);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn given_chat_when_sent_then_server_decrypts_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::Connected));

        let reply = h.client.chat("hello server").await.unwrap();
        assert_eq!(reply, ChatReply::Confirmed(CHAT_CONFIRMATION.to_string()));

        let SessionEvent::ChatReceived { text } = next_event(&mut h.events).await else {
            panic!("expected ChatReceived");
        };
        assert_eq!(text, "hello server");

        h.client.stop().await.unwrap();
        wait_finished(&mut h.events).await;
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_unknown_token_when_sent_then_session_continues_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;

        let ack = h.client.send_token(*b"HELLO\0\0\0").await.unwrap();
        assert_eq!(ack, TOKEN_ACK);

        // Still serving: a chat after the ignored token works.
        let reply = h.client.chat("still here").await.unwrap();
        assert!(matches!(reply, ChatReply::Confirmed(_)));

        let mut conn = h.client.stop().await.unwrap();
        let events = wait_finished(&mut h.events).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::UnknownCommand { token } if token == "\"HELLO\""))
        );
        tokio::time::timeout(TIMEOUT, h.server).await.unwrap().unwrap();

        // Server side is closed: reads report EOF.
        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn given_file_upload_when_sizes_match_then_success_and_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;

        for len in [0usize, 1, 1023, 1024, 2500] {
            let body: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let header = FileHeader {
                size: len as u64,
                extension: "bin".into(),
            };
            let mut reader = &body[..];
            let reply = h.client.upload(&mut reader, &header).await.unwrap();
            assert!(reply.ok, "len {len}: {}", reply.message);
            assert_eq!(reply.message, FILE_SUCCESS);

            let path = loop {
                if let SessionEvent::FileReceived { path, size_bytes } =
                    next_event(&mut h.events).await
                {
                    assert_eq!(size_bytes, len as u64);
                    break path;
                }
            };
            assert_eq!(tokio::fs::read(&path).await.unwrap(), body, "len {len}");
            assert!(path.to_string_lossy().ends_with(".bin"));
        }

        h.client.stop().await.unwrap();
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_peer_disconnects_mid_upload_when_receiving_then_failure_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;
        let secret = h.client.secret();
        let mut conn = h.client.into_inner();

        conn.write_all(&xorlink_core::protocol::Command::Send.token())
            .await
            .unwrap();
        let mut ack = [0u8; ACK_LEN];
        conn.read_full(&mut ack).await.unwrap();

        let header = FileHeader {
            size: 2500,
            extension: "txt".into(),
        };
        conn.write_all(&header.to_bytes()).await.unwrap();
        let mut partial = vec![b'x'; 1000];
        cipher::apply(&mut partial, secret);
        conn.write_all(&partial).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut reply = [0u8; ACK_LEN];
        conn.read_full(&mut reply).await.unwrap();
        assert_eq!(decode_ack(&reply), FILE_FAILURE);

        let events = wait_finished(&mut h.events).await;
        let failed = events.iter().find_map(|e| match e {
            SessionEvent::FileFailed {
                path,
                received,
                declared,
                ..
            } => Some((path.clone(), *received, *declared)),
            _ => None,
        });
        let (path, received, declared) = failed.expect("FileFailed event");
        assert_eq!((received, declared), (1000, 2500));
        // Partial output stays on disk.
        let kept = tokio::fs::read(path.unwrap()).await.unwrap();
        assert_eq!(kept, vec![b'x'; 1000]);
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_source_shorter_than_header_when_uploading_then_both_ends_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;
        let header = FileHeader {
            size: 100,
            extension: "txt".into(),
        };
        let mut reader = &b"only ten b"[..];

        let err = tokio::time::timeout(TIMEOUT, h.client.upload(&mut reader, &header))
            .await
            .expect("upload did not finish")
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::UploadAborted {
                sent: 10,
                declared: 100,
                ..
            }
        ));

        let events = wait_finished(&mut h.events).await;
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::FileFailed {
                received: 10,
                declared: 100,
                ..
            }
        )));
        tokio::time::timeout(TIMEOUT, h.server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn given_missing_receive_dir_when_uploading_then_failure_and_session_continues() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let mut h = start(&missing, None).await;

        let body = vec![7u8; 1500];
        let header = FileHeader {
            size: 1500,
            extension: "dat".into(),
        };
        let mut reader = &body[..];
        let reply = h.client.upload(&mut reader, &header).await.unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.message, FILE_FAILURE);

        // The body was drained: the next command is parsed correctly.
        let chat = h.client.chat("after failure").await.unwrap();
        assert!(matches!(chat, ChatReply::Confirmed(_)));

        h.client.stop().await.unwrap();
        let events = wait_finished(&mut h.events).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::FileFailed { path: None, .. }))
        );
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_idle_peer_when_timeout_elapses_then_session_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), Some(Duration::from_millis(50))).await;

        let events = wait_finished(&mut h.events).await;
        assert!(events.iter().any(
            |e| matches!(e, SessionEvent::Error { message } if message.contains("timed out"))
        ));
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_engine_cancels_when_session_idle_then_session_ends_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;
        assert!(matches!(next_event(&mut h.events).await, SessionEvent::Connected));

        h.cancel.cancel();
        let events = wait_finished(&mut h.events).await;
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
        h.server.await.unwrap();
    }

    #[tokio::test]
    async fn given_client_drops_connection_when_idle_then_session_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = start(dir.path(), None).await;
        drop(h.client);

        let events = wait_finished(&mut h.events).await;
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
        h.server.await.unwrap();
    }
}
