//! One relayed connection: a client leg, a server leg, and the pipeline
//! between them.
//!
//! # Task layout
//!
//! ```text
//!  client ──► client pump ──► pipeline(Outbound) ──► server outbox ──► server writer ──► server
//!  client ◄── client writer ◄── client outbox ◄── pipeline(Inbound) ◄── server pump ◄── server
//! ```
//!
//! Each pump runs the handler chain for its direction, so packets in one
//! direction are processed strictly in arrival order.  The outboxes are also
//! where handlers' synthesized packets go, via [`SessionSink`].
//!
//! The session ends as soon as any of the four tasks ends or
//! [`SessionHandle::close`] is called.  Teardown stops both pumps and every
//! background worker, lets each writer flush what was already forwarded
//! (bounded by [`DRAIN_GRACE`]), then tells handlers the session is over.

use std::fmt;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mitm_core::intercept::{Direction, PacketPipeline, PacketSink, Verdict, WorkerFuture};
use mitm_core::protocol::packets::GamePacket;

use crate::domain::RelayConfig;
use crate::infrastructure::leg::{self, LegEnd};

/// How long a writer may keep flushing its outbox once the session closes.
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while setting a session up.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot connect to upstream {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {addr} did not answer within {limit:?}")]
    ConnectTimeout { addr: SocketAddr, limit: Duration },
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// Where a session is in its life.  Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        })
    }
}

/// One side of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Client,
    Server,
}

impl Endpoint {
    /// Direction of the packets read from this endpoint.
    pub fn read_direction(self) -> Direction {
        match self {
            Endpoint::Client => Direction::Outbound,
            Endpoint::Server => Direction::Inbound,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endpoint::Client => "client",
            Endpoint::Server => "server",
        })
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The endpoint closed its connection.
    PeerClosed(Endpoint),
    /// Nothing arrived from the endpoint within the idle timeout.
    IdleTimeout(Endpoint),
    /// The endpoint sent bytes that are not a valid frame stream.
    Framing { endpoint: Endpoint, error: String },
    /// Reading from or writing to the endpoint failed.
    Transport { endpoint: Endpoint, error: String },
    /// [`SessionHandle::close`] was called.
    Requested,
    /// A session task panicked or was cancelled.
    TaskFailed(String),
    /// The upstream server could not be reached; nothing was relayed.
    Upstream(String),
}

impl CloseReason {
    fn from_leg(endpoint: Endpoint, end: LegEnd) -> Self {
        match end {
            LegEnd::Eof => CloseReason::PeerClosed(endpoint),
            LegEnd::IdleTimeout(_) => CloseReason::IdleTimeout(endpoint),
            LegEnd::Framing(e) => CloseReason::Framing {
                endpoint,
                error: e.to_string(),
            },
            LegEnd::Io(e) => CloseReason::Transport {
                endpoint,
                error: e.to_string(),
            },
            // A leg only stops on request when the session is already going down.
            LegEnd::Stopped => CloseReason::Requested,
        }
    }

    fn from_join(endpoint: Endpoint, joined: Result<LegEnd, JoinError>) -> Self {
        match joined {
            Ok(end) => CloseReason::from_leg(endpoint, end),
            Err(e) => CloseReason::TaskFailed(format!("{endpoint} task: {e}")),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed(endpoint) => write!(f, "{endpoint} closed the connection"),
            CloseReason::IdleTimeout(endpoint) => write!(f, "{endpoint} went idle"),
            CloseReason::Framing { endpoint, error } => {
                write!(f, "framing error from {endpoint}: {error}")
            }
            CloseReason::Transport { endpoint, error } => {
                write!(f, "transport error on {endpoint} leg: {error}")
            }
            CloseReason::Requested => f.write_str("closed by relay"),
            CloseReason::TaskFailed(detail) => write!(f, "session task failed: {detail}"),
            CloseReason::Upstream(error) => write!(f, "upstream unavailable: {error}"),
        }
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Live traffic counters, shared by the session's tasks.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub(crate) forwarded: AtomicU64,
    pub(crate) intercepted: AtomicU64,
    pub(crate) synthesized: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) encode_errors: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Packets that came out of the chain and were queued for the other leg.
    pub forwarded: u64,
    /// Packets a handler intercepted.
    pub intercepted: u64,
    /// Packets handlers injected through the sink.
    pub synthesized: u64,
    /// Packets (or whole frames) that could not be decoded and were skipped.
    pub decode_errors: u64,
    /// Packets dropped because they could not be encoded.
    pub encode_errors: u64,
}

/// What [`RelaySession::run`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub id: Uuid,
    pub reason: CloseReason,
    pub stats: SessionStats,
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Per-session tunables, taken from [`RelayConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Silence on either leg longer than this ends the session.
    pub idle_timeout: Duration,
    /// Most packets packed into one outgoing frame.
    pub max_batch: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for SessionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            max_batch: config.max_batch,
        }
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Background work spawned by handlers.  Closed once the session tears down.
#[derive(Default)]
struct Workers {
    tasks: JoinSet<()>,
    closed: bool,
}

/// The [`PacketSink`] handed to handlers.  Synthesized packets go straight to
/// the target leg's outbox and skip the handler chain.
#[derive(Clone)]
pub struct SessionSink {
    label: Arc<str>,
    to_server: UnboundedSender<GamePacket>,
    to_client: UnboundedSender<GamePacket>,
    counters: Arc<SessionCounters>,
    workers: Arc<Mutex<Workers>>,
}

impl SessionSink {
    fn outbox(&self, direction: Direction) -> &UnboundedSender<GamePacket> {
        match direction {
            Direction::Outbound => &self.to_server,
            Direction::Inbound => &self.to_client,
        }
    }

    /// Aborts every worker, refuses new ones, and waits until the aborted
    /// tasks are gone.  Returns how many were still tracked.
    async fn close(&self) -> usize {
        let mut tasks = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.closed = true;
            std::mem::take(&mut workers.tasks)
        };
        let tracked = tasks.len();
        tasks.shutdown().await;
        tracked
    }
}

impl PacketSink for SessionSink {
    fn send(&self, direction: Direction, packet: GamePacket) {
        enqueue(&self.label, self.outbox(direction), &self.counters, direction, packet);
    }

    fn send_after(&self, delay: Duration, direction: Direction, packet: GamePacket) {
        let label = Arc::clone(&self.label);
        let outbox = self.outbox(direction).clone();
        let counters = Arc::clone(&self.counters);
        self.spawn_worker(
            "delayed send",
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                enqueue(&label, &outbox, &counters, direction, packet);
            }),
        );
    }

    fn spawn_worker(&self, name: &str, work: WorkerFuture) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.closed {
            debug!("{}: not starting worker {name:?}, session is closing", self.label);
            return;
        }
        // Reap finished workers so the set does not grow for the whole session.
        while workers.tasks.try_join_next().is_some() {}
        workers.tasks.spawn(work);
        debug!("{}: started worker {name:?}", self.label);
    }
}

fn enqueue(
    label: &str,
    outbox: &UnboundedSender<GamePacket>,
    counters: &SessionCounters,
    direction: Direction,
    packet: GamePacket,
) {
    let name = packet.name();
    if outbox.send(packet).is_ok() {
        counters.synthesized.fetch_add(1, Ordering::Relaxed);
    } else {
        debug!("{label}: dropped synthesized {name}, {direction} leg is gone");
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Cheap handle for watching or closing a running session from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Asks the session to shut down.  Returns `false` if it was already
    /// closing or closed.
    pub fn close(&self) -> bool {
        advance(&self.state, SessionState::Closing)
    }

    /// Resolves once the session has fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Moves the state forward; never backwards.
fn advance(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if *current < next {
            *current = next;
            true
        } else {
            false
        }
    })
}

pub struct RelaySession {
    id: Uuid,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    settings: SessionSettings,
    pipeline: PacketPipeline,
    state: Arc<watch::Sender<SessionState>>,
}

impl RelaySession {
    pub fn new(
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        settings: SessionSettings,
        pipeline: PacketPipeline,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: Uuid::new_v4(),
            client_addr,
            server_addr,
            settings,
            pipeline,
            state: Arc::new(state),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn pipeline(&self) -> &PacketPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }

    /// Relays between `client` and `server` until either side goes away, a
    /// leg fails, or the session is closed through a [`SessionHandle`].
    pub async fn run<C, S>(self, client: C, server: S) -> SessionOutcome
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let label: Arc<str> = Arc::from(format!("session {}", self.id));
        let counters = Arc::new(SessionCounters::default());

        if !advance(&self.state, SessionState::Active) {
            // Closed before it started.
            return self.finish(&label, CloseReason::Requested, &counters);
        }
        info!(
            "{label}: relaying {} <-> {}",
            self.client_addr, self.server_addr
        );

        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let (to_server, server_outbox) = mpsc::unbounded_channel();
        let (to_client, client_outbox) = mpsc::unbounded_channel();

        let sink = SessionSink {
            label: Arc::clone(&label),
            to_server: to_server.clone(),
            to_client: to_client.clone(),
            counters: Arc::clone(&counters),
            workers: Arc::new(Mutex::new(Workers::default())),
        };

        let pump = |endpoint: Endpoint, forward_to: UnboundedSender<GamePacket>| Pump {
            endpoint,
            label: Arc::clone(&label),
            forward_to,
            pipeline: self.pipeline.clone(),
            sink: sink.clone(),
            state: self.state.subscribe(),
            counters: Arc::clone(&counters),
        };
        let client_pump = pump(Endpoint::Client, to_server);
        let server_pump = pump(Endpoint::Server, to_client);

        let idle = self.settings.idle_timeout;
        let max_batch = self.settings.max_batch.max(1);
        let mut client_pump = tokio::spawn(client_pump.run(client_read, idle));
        let mut server_pump = tokio::spawn(server_pump.run(server_read, idle));
        let mut client_writer = tokio::spawn(write_leg(
            client_write,
            client_outbox,
            max_batch,
            Arc::clone(&counters),
            format!("{label} client"),
        ));
        let mut server_writer = tokio::spawn(write_leg(
            server_write,
            server_outbox,
            max_batch,
            Arc::clone(&counters),
            format!("{label} server"),
        ));

        let reason = tokio::select! {
            r = &mut client_pump => CloseReason::from_join(Endpoint::Client, r),
            r = &mut server_pump => CloseReason::from_join(Endpoint::Server, r),
            r = &mut client_writer => CloseReason::from_join(Endpoint::Client, r),
            r = &mut server_writer => CloseReason::from_join(Endpoint::Server, r),
            () = closing(self.state.subscribe()) => CloseReason::Requested,
        };

        advance(&self.state, SessionState::Closing);

        // Stop reading.  Once the pumps, the workers and `sink` are gone, no
        // sender is left and each writer ends after its queue is empty.
        for pump in [&mut client_pump, &mut server_pump] {
            if !pump.is_finished() {
                pump.abort();
                let _ = pump.await;
            }
        }
        let aborted = sink.close().await;
        if aborted > 0 {
            debug!("{label}: aborted {aborted} worker(s)");
        }
        drop(sink);

        for (endpoint, writer) in [
            (Endpoint::Client, &mut client_writer),
            (Endpoint::Server, &mut server_writer),
        ] {
            if writer.is_finished() {
                continue;
            }
            if timeout(DRAIN_GRACE, &mut *writer).await.is_err() {
                warn!("{label}: {endpoint} writer still busy after {DRAIN_GRACE:?}, dropping its queue");
                writer.abort();
            }
        }

        self.finish(&label, reason, &counters)
    }

    /// Ends a session that never got to run.  Handlers still receive their
    /// disconnect notification.
    pub fn abandon(self, reason: CloseReason) -> SessionOutcome {
        let label = format!("session {}", self.id);
        self.finish(&label, reason, &SessionCounters::default())
    }

    fn finish(&self, label: &str, reason: CloseReason, counters: &SessionCounters) -> SessionOutcome {
        advance(&self.state, SessionState::Closing);
        self.pipeline.notify_disconnect(&reason.to_string());
        advance(&self.state, SessionState::Closed);

        let stats = counters.snapshot();
        info!(
            "{label}: closed ({reason}); forwarded={} intercepted={} synthesized={} decode_errors={}",
            stats.forwarded, stats.intercepted, stats.synthesized, stats.decode_errors
        );
        SessionOutcome {
            id: self.id,
            reason,
            stats,
        }
    }
}

/// Resolves once the session leaves `Active`.
async fn closing(mut state: watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s > SessionState::Active).await;
}

async fn write_leg<W>(
    writer: W,
    outbox: mpsc::UnboundedReceiver<GamePacket>,
    max_batch: usize,
    counters: Arc<SessionCounters>,
    label: String,
) -> LegEnd
where
    W: AsyncWrite + Unpin,
{
    leg::write_frames(writer, outbox, max_batch, &counters, &label).await
}

// ── Pump ──────────────────────────────────────────────────────────────────────

/// Reader side of one leg: decodes packets, runs the chain, forwards.
struct Pump {
    endpoint: Endpoint,
    label: Arc<str>,
    forward_to: UnboundedSender<GamePacket>,
    pipeline: PacketPipeline,
    sink: SessionSink,
    state: watch::Receiver<SessionState>,
    counters: Arc<SessionCounters>,
}

impl Pump {
    async fn run<R>(self, reader: R, idle_timeout: Duration) -> LegEnd
    where
        R: AsyncRead + Unpin,
    {
        let direction = self.endpoint.read_direction();
        let end = leg::read_frames(reader, idle_timeout, |decoded| {
            // Nothing is processed once the session starts closing.
            if *self.state.borrow() != SessionState::Active {
                return ControlFlow::Break(());
            }

            let packet = match decoded {
                Ok(packet) => packet,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: skipping undecodable {direction} data: {e}", self.label);
                    return ControlFlow::Continue(());
                }
            };

            match self.pipeline.process(direction, packet, &self.sink) {
                Verdict::Forward(packet) => {
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    if self.forward_to.send(packet).is_err() {
                        return ControlFlow::Break(());
                    }
                }
                Verdict::Drop => {
                    self.counters.intercepted.fetch_add(1, Ordering::Relaxed);
                }
            }
            ControlFlow::Continue(())
        })
        .await;

        debug!("{}: {} reader stopped: {end:?}", self.label, self.endpoint);
        end
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
