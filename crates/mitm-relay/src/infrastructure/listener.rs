//! Client-facing listener: accept loop and per-session task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming connections from game clients.
//! 3. Opening a matching connection to the upstream server.
//! 4. Building a fresh pipeline for the pair (system handlers first, then
//!    whatever modules the embedding program installs).
//! 5. Running the [`RelaySession`] in its own task.
//! 6. Closing every live session when the `running` flag is cleared.
//!
//! # Scalability
//!
//! Each session runs in its own Tokio task and owns its own pipeline, game
//! state and event bus, so sessions never contend with each other.  The
//! accept loop never blocks on a session: it spawns and moves on.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{error, info, warn};

use mitm_core::intercept::PacketPipeline;

use crate::application::install_system_handlers;
use crate::domain::config::RelayConfig;
use crate::infrastructure::leg::connect_upstream;
use crate::infrastructure::session::{
    CloseReason, RelaySession, SessionHandle, SessionSettings, SessionState,
};

/// How long `accept()` waits before the loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// How long shutdown waits for each session to finish tearing down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Registers gameplay modules on a new session's pipeline.  Runs after the
/// system handlers are in place.
pub type ModuleInstaller = Arc<dyn Fn(&PacketPipeline) + Send + Sync>;

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs the relay with no gameplay modules until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_relay(config: RelayConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    run_relay_with(config, Arc::new(|_: &PacketPipeline| {}), running).await
}

/// Runs the accept loop, calling `modules` on every new session's pipeline.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound (e.g. the port is already
/// in use or the process lacks permission to bind).
pub async fn run_relay_with(
    config: RelayConfig,
    modules: ModuleInstaller,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        "relay listening on {}, forwarding to {}",
        config.listen_addr, config.upstream_addr
    );
    serve(listener, config, modules, running).await;
    Ok(())
}

/// Accept loop over an already-bound listener.  Returns once `running` is
/// cleared and every session has closed (or the grace period ran out).
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    modules: ModuleInstaller,
    running: Arc<AtomicBool>,
) {
    let config = Arc::new(config);
    let mut sessions: Vec<SessionHandle> = Vec::new();

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the `running` flag is checked even when nobody
        // connects.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new client connection from {peer_addr}");
                sessions.retain(|s| s.state() != SessionState::Closed);

                let session = prepare_session(&config, &modules, peer_addr);
                sessions.push(session.handle());
                let cfg = Arc::clone(&config);
                tokio::spawn(async move {
                    handle_client(stream, session, cfg).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. out of file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    close_all(&sessions).await;
}

// ── Per-session handler ───────────────────────────────────────────────────────

fn prepare_session(
    config: &RelayConfig,
    modules: &ModuleInstaller,
    peer_addr: SocketAddr,
) -> RelaySession {
    let pipeline = PacketPipeline::with_defaults();
    install_system_handlers(&pipeline, &config.command_prefix);
    modules(&pipeline);

    RelaySession::new(
        peer_addr,
        config.upstream_addr,
        SessionSettings::from(config),
        pipeline,
    )
}

/// Connects upstream and runs `session` to completion, logging the outcome.
async fn handle_client(client: TcpStream, session: RelaySession, config: Arc<RelayConfig>) {
    let id = session.id();
    if let Err(e) = client.set_nodelay(true) {
        warn!("session {id}: could not disable Nagle on client leg: {e}");
    }

    let server = match connect_upstream(config.upstream_addr, config.connect_timeout()).await {
        Ok(server) => server,
        Err(e) => {
            warn!("session {id}: {e}");
            session.abandon(CloseReason::Upstream(e.to_string()));
            return;
        }
    };

    let outcome = session.run(client, server).await;
    info!(
        "session {id}: done ({}) after {} forwarded, {} intercepted",
        outcome.reason, outcome.stats.forwarded, outcome.stats.intercepted
    );
}

async fn close_all(sessions: &[SessionHandle]) {
    let live: Vec<&SessionHandle> = sessions
        .iter()
        .filter(|s| s.state() != SessionState::Closed)
        .collect();
    if live.is_empty() {
        return;
    }

    info!("closing {} live session(s)", live.len());
    for session in &live {
        session.close();
    }
    for session in live {
        if timeout(SHUTDOWN_GRACE, session.closed()).await.is_err() {
            warn!("session {} did not close within {SHUTDOWN_GRACE:?}", session.id());
        }
    }
}
