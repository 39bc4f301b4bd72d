//! mitm-relay: man-in-the-middle packet relay, entry point.
//!
//! This binary listens for game clients, opens a matching connection to the
//! real server for each one, and relays every packet through the interception
//! pipeline.  The player talks to the relay with chat commands (`!help`).
//!
//! # Usage
//!
//! ```text
//! mitm-relay [OPTIONS]
//!
//! Options:
//!   --config          <FILE>   TOML config file
//!   --listen          <ADDR>   Address clients connect to     [default: 0.0.0.0:19133]
//!   --upstream        <ADDR>   Address of the real server     [default: 127.0.0.1:19132]
//!   --idle-timeout    <SECS>   Close a leg silent this long   [default: 30]
//!   --connect-timeout <SECS>   Upstream connect timeout       [default: 10]
//!   --max-batch       <N>      Packets per outgoing frame     [default: 64]
//!   --command-prefix  <TEXT>   Chat command prefix            [default: !]
//!   --log-level       <LEVEL>  Log filter when RUST_LOG unset [default: info]
//! ```
//!
//! # Where settings come from
//!
//! Built-in defaults, then the config file, then command-line flags (or their
//! environment variables).  Later sources win.
//!
//! | Variable              | Flag                |
//! |-----------------------|---------------------|
//! | `MITM_CONFIG`         | `--config`          |
//! | `MITM_LISTEN`         | `--listen`          |
//! | `MITM_UPSTREAM`       | `--upstream`        |
//! | `MITM_IDLE_TIMEOUT`   | `--idle-timeout`    |
//! | `MITM_CONNECT_TIMEOUT`| `--connect-timeout` |
//! | `MITM_MAX_BATCH`      | `--max-batch`       |
//! | `MITM_COMMAND_PREFIX` | `--command-prefix`  |
//! | `MITM_LOG_LEVEL`      | `--log-level`       |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mitm_relay::domain::RelayConfig;
use mitm_relay::infrastructure::run_relay;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Man-in-the-middle packet relay.
///
/// Every flag is optional; unset flags keep the value from the config file
/// (or the built-in default).
#[derive(Debug, Parser)]
#[command(
    name = "mitm-relay",
    about = "Man-in-the-middle relay with an interceptable packet pipeline",
    version
)]
struct Cli {
    /// TOML config file.
    #[arg(long, env = "MITM_CONFIG")]
    config: Option<PathBuf>,

    /// Address game clients connect to.
    #[arg(long, env = "MITM_LISTEN")]
    listen: Option<SocketAddr>,

    /// Address of the real game server.
    #[arg(long, env = "MITM_UPSTREAM")]
    upstream: Option<SocketAddr>,

    /// Seconds of silence on a leg before the session is closed.
    #[arg(long, env = "MITM_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Seconds to wait for the upstream server to accept.
    #[arg(long, env = "MITM_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Most packets packed into one outgoing frame.
    #[arg(long, env = "MITM_MAX_BATCH")]
    max_batch: Option<usize>,

    /// Prefix that marks a chat line as a relay command.
    #[arg(long, env = "MITM_COMMAND_PREFIX")]
    command_prefix: Option<String>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, env = "MITM_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Builds the effective [`RelayConfig`]: file (if any), then flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the merged configuration is invalid.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => RelayConfig::default(),
        };

        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.upstream {
            config.upstream_addr = addr;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout_secs = secs;
        }
        if let Some(n) = self.max_batch {
            config.max_batch = n;
        }
        if let Some(prefix) = self.command_prefix {
            config.command_prefix = prefix;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and merged with the config file.
/// 2. `tracing_subscriber` is initialised.  `RUST_LOG` wins; otherwise the
///    configured `log_level` is used.
/// 3. A Ctrl+C handler is spawned; it clears a shared `AtomicBool`.
/// 4. [`run_relay`] accepts clients until the flag is cleared, then closes
///    every live session.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_relay_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        "mitm-relay starting: listen={}, upstream={}",
        config.listen_addr, config.upstream_addr
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_relay(config, running).await?;

    info!("mitm-relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
