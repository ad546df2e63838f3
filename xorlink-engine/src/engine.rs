use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use xorlink_core::transport::{Connection, Listener, ListenerFactory};

use crate::pool::{TaskHandle, WorkerPool, default_worker_count};
use crate::session::{
    ChatSessionHandler, RngSource, SessionConfig, SessionContext, SessionEvent, SessionHandler,
};

// ── Engine commands (UI → engine) ───────────────────────────────────

/// Commands sent by the CLI to control the engine.
#[derive(Clone, Debug)]
pub enum EngineCmd {
    /// Bind a listener on `addr` and start accepting connections.
    StartAccepting { addr: String },
    /// Stop accepting new connections (drop the listener). Running
    /// sessions are unaffected.
    StopAccepting,
    /// Cancel every session, drain the worker pool and stop the engine.
    ShutDown,
}

// ── Engine events (engine → UI) ─────────────────────────────────────

/// Events emitted by the engine for the CLI to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// The listener is bound and accepting connections on `addr`.
    Accepting { addr: String },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A connection was accepted and queued for a worker.
    SessionCreated { session_id: u64, peer: String },
    /// A session-level event, tagged with the session ID.
    SessionEvent {
        session_id: u64,
        event: SessionEvent,
    },
    /// A non-fatal error occurred inside the engine.
    Error { message: String },
    /// Every session has finished and the engine loop has exited.
    Stopped,
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`]. Lets the caller send commands
/// and subscribe to events.
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub events_tx: broadcast::Sender<EngineEvent>,
}

// ── Engine ──────────────────────────────────────────────────────────

/// Engine-wide settings.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Worker count, which is also the cap on concurrently served sessions.
    pub workers: usize,
    /// Settings handed to every session.
    pub session: SessionConfig,
    /// Fixed seed for key agreement randomness. `None` draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            session: SessionConfig::default(),
            rng_seed: None,
        }
    }
}

/// The xorlink server engine.
///
/// Accepts inbound connections and runs one session per connection on a
/// [`WorkerPool`]. Connections beyond the worker count wait in the pool's
/// queue until a session ends.
///
/// The engine is generic over `F: ListenerFactory` so the caller can plug
/// in TCP or any other transport without changing the engine code.
pub struct Engine;

impl Engine {
    /// Spawn the engine event loop serving the chat protocol and return a
    /// handle to control it.
    ///
    /// The engine starts idle; no listener is active until
    /// [`EngineCmd::StartAccepting`] is received.
    pub fn start<F>(self, factory: F, config: EngineConfig) -> EngineHandle
    where
        F: ListenerFactory,
    {
        let rng = config.rng_seed.map_or(RngSource::Entropy, RngSource::Seeded);
        let handler = ChatSessionHandler::new(config.session).with_rng(rng);
        self.start_with_handler(factory, handler, config.workers)
    }

    /// Like [`start`](Self::start) but with a custom [`SessionHandler`].
    pub fn start_with_handler<F, H>(self, factory: F, handler: H, workers: usize) -> EngineHandle
    where
        F: ListenerFactory,
        H: SessionHandler<<F::L as Listener>::Conn>,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(32);
        let (events_tx, _) = broadcast::channel::<EngineEvent>(256);

        let events = events_tx.clone();

        info!(workers, "Spawning engine event loop");

        tokio::spawn(run_engine_loop(
            factory,
            Arc::new(handler),
            workers,
            cmd_rx,
            events,
        ));

        debug!("Engine started successfully");
        EngineHandle { cmd_tx, events_tx }
    }
}

/// The main engine event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Engine` itself.
async fn run_engine_loop<F, H>(
    factory: F,
    handler: Arc<H>,
    workers: usize,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    events: broadcast::Sender<EngineEvent>,
) where
    F: ListenerFactory,
    H: SessionHandler<<F::L as Listener>::Conn>,
{
    debug!("Engine event loop running");

    let pool = WorkerPool::start(workers);
    let root_cancel = CancellationToken::new();
    let mut listener: Option<F::L> = None;
    let mut next_session_id: u64 = 1;
    let mut forwarders = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCmd::StartAccepting { addr }) => {
                        info!(addr = %addr, "Received StartAccepting command");
                        match factory.bind(&addr).await {
                            Ok(l) => {
                                let bound_addr = l.local_addr();
                                info!(addr = %bound_addr, "Listener bound");
                                listener = Some(l);
                                let _ = events.send(EngineEvent::Accepting {
                                    addr: bound_addr,
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to bind listener");
                                let _ = events.send(EngineEvent::Error {
                                    message: format!("{e:#}"),
                                });
                            }
                        }
                    }

                    Some(EngineCmd::StopAccepting) => {
                        info!("Received StopAccepting command");
                        listener = None;
                        let _ = events.send(EngineEvent::AcceptingStopped);
                    }

                    Some(EngineCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }

                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Accept inbound connections ───────────────────────
            result = async {
                if let Some(l) = listener.as_mut() {
                    l.accept().await
                } else {
                    std::future::pending().await
                }
            }, if listener.is_some() => {
                match result {
                    Ok(conn) => {
                        let sid = next_session_id;
                        next_session_id += 1;
                        dispatch_session(
                            &pool,
                            &handler,
                            &root_cancel,
                            &events,
                            &mut forwarders,
                            sid,
                            conn,
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        let _ = events.send(EngineEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
        }
    }

    // Close the listening socket before waiting on sessions.
    drop(listener);
    debug!(pending = pool.pending(), "Cancelling sessions");
    root_cancel.cancel();
    pool.shutdown().await;
    while forwarders.join_next().await.is_some() {}

    let _ = events.send(EngineEvent::Stopped);
    info!("Engine event loop stopped");
}

/// Queues one accepted connection on the pool.
fn dispatch_session<C, H>(
    pool: &WorkerPool,
    handler: &Arc<H>,
    root_cancel: &CancellationToken,
    events: &broadcast::Sender<EngineEvent>,
    forwarders: &mut JoinSet<()>,
    session_id: u64,
    conn: C,
) where
    C: Connection,
    H: SessionHandler<C>,
{
    let peer = conn.peer();
    info!(session_id, peer = %peer, "Connection accepted");
    let _ = events.send(EngineEvent::SessionCreated { session_id, peer });

    let (event_tx, event_rx) = mpsc::channel(32);
    let ctx = SessionContext {
        session_id,
        cancel: root_cancel.child_token(),
        events: event_tx,
    };
    let handler = Arc::clone(handler);
    match pool.submit(async move { handler.handle(conn, ctx).await }) {
        Ok(task) => {
            debug!(session_id, pending = pool.pending(), "Session queued");
            // Reap forwarders of sessions that already ended.
            while forwarders.try_join_next().is_some() {}
            forwarders.spawn(forward_session_events(
                session_id,
                event_rx,
                task,
                events.clone(),
            ));
        }
        Err(e) => {
            // The rejected future owned the connection, so it is already closed.
            warn!(session_id, error = %e, "Session rejected");
            let _ = events.send(EngineEvent::Error {
                message: format!("session {session_id}: {e}"),
            });
        }
    }
}

/// Reads [`SessionEvent`]s from a session and re-publishes them as
/// [`EngineEvent::SessionEvent`]s on the engine broadcast channel, tagged
/// with the session ID. Once the session is done, reports a panicked task.
async fn forward_session_events(
    session_id: u64,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    task: TaskHandle<()>,
    events_tx: broadcast::Sender<EngineEvent>,
) {
    while let Some(ev) = event_rx.recv().await {
        let is_finished = matches!(ev, SessionEvent::Finished);
        let _ = events_tx.send(EngineEvent::SessionEvent {
            session_id,
            event: ev,
        });
        if is_finished {
            break;
        }
    }

    if let Err(e) = task.join().await {
        warn!(session_id, error = %e, "Session task did not complete");
        let _ = events_tx.send(EngineEvent::Error {
            message: format!("session {session_id}: {e}"),
        });
    }
    debug!(session_id = session_id, "Session event forwarder stopped");
}

// ── Tests ───────────────────────────────────────────────────────────
