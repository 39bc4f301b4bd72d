//! Infrastructure layer for mitm-relay.
//!
//! The infrastructure layer handles all I/O: accepting game clients, opening
//! the matching upstream connection, and moving frames between the two.
//!
//! # Responsibilities
//!
//! - Binding the client-facing TCP listener (`listener`)
//! - Connecting to the upstream server and framed reads/writes (`leg`)
//! - Running one relayed connection: tasks, outboxes, teardown (`session`)
//! - Handling the graceful shutdown signal
//!
//! # What does NOT belong here?
//!
//! - Packet handling logic (that is the application layer or a module)
//! - Configuration parsing (that is the domain layer and `main.rs`)

pub mod leg;
pub mod listener;
pub mod session;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use listener::{run_relay, run_relay_with, serve, ModuleInstaller};
pub use session::{
    CloseReason, Endpoint, RelaySession, SessionError, SessionHandle, SessionOutcome,
    SessionSettings, SessionState, SessionStats,
};
