//! Application layer for mitm-relay.
//!
//! The application layer holds the handlers the relay itself contributes to
//! every session.  It knows *what* to do with packets but not how they reach
//! the wire.
//!
//! # Responsibilities
//!
//! - Tracking game state from observed traffic (`state_tracker`)
//! - Answering chat commands typed by the player (`commands`)
//! - Installing both, in the right order, on a fresh session pipeline
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or spawning tasks (that is infrastructure)
//! - Gameplay modules; those are registered by the embedding program

pub mod commands;
pub mod state_tracker;

use std::sync::Arc;

use mitm_core::intercept::{Direction, PacketPipeline};

pub use commands::CommandHandler;
pub use state_tracker::StateTracker;

/// Registration name of the state tracker.
pub const STATE_TRACKER: &str = "state-tracker";

/// Registration name of the chat command handler.
pub const COMMANDS: &str = "commands";

/// Handlers the chat `toggle` command refuses to touch.
pub const SYSTEM_HANDLERS: [&str; 2] = [STATE_TRACKER, COMMANDS];

/// Registers the relay's own handlers on `pipeline`.
///
/// Must run before any module registers: the state tracker has to see each
/// packet first so modules read fresh state, and the command handler has to
/// sit early enough that modules can still observe the intercepted line.
pub fn install_system_handlers(pipeline: &PacketPipeline, command_prefix: &str) {
    pipeline.registry().register_shared(
        STATE_TRACKER,
        &[Direction::Inbound, Direction::Outbound],
        Arc::new(StateTracker::new()),
    );
    commands::register(CommandHandler::new(command_prefix), pipeline.registry());
}
