//! mitm-relay library crate.
//!
//! This crate sits between a game client and a game server, decodes the
//! packets flowing both ways, and runs each one through a chain of handlers
//! that may observe, replace or drop it, or inject new packets.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Game client
//!         ↕
//! [mitm-relay]
//!   ├── domain/           Pure types: RelayConfig
//!   ├── application/      System handlers: state tracker, chat commands
//!   └── infrastructure/
//!         ├── listener/   Accept loop, one task per client
//!         ├── session/    Pumps, writers and outboxes for one client
//!         └── leg/        Framed reads and writes (mitm-core codec)
//!         ↕
//! Game server
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `mitm-core` only.
//! - `infrastructure` depends on all other layers plus `tokio`.
//!
//! # For beginners: adding a module
//!
//! A module is any [`mitm_core::PacketHandler`].  Register it from the
//! installer passed to [`infrastructure::run_relay_with`]; every new session
//! gets its own pipeline, so the installer runs once per client:
//!
//! ```no_run
//! use std::sync::{atomic::AtomicBool, Arc};
//! use mitm_core::intercept::{handler_fn, Direction, PacketPipeline};
//! use mitm_relay::domain::RelayConfig;
//! use mitm_relay::infrastructure::run_relay_with;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let modules = Arc::new(|pipeline: &PacketPipeline| {
//!     pipeline.registry().register(
//!         "log-chat",
//!         Direction::Inbound,
//!         handler_fn(|packet, _ctx| {
//!             tracing::info!("server sent {}", packet.packet().name());
//!             Ok(())
//!         }),
//!     );
//! });
//! run_relay_with(RelayConfig::default(), modules, Arc::new(AtomicBool::new(true))).await
//! # }
//! ```

/// Domain layer: configuration types (no I/O).
pub mod domain;

/// Application layer: handlers the relay installs on every session.
pub mod application;

/// Infrastructure layer: listener, sessions and framed socket I/O.
pub mod infrastructure;
