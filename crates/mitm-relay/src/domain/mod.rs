//! Domain layer for mitm-relay.
//!
//! The domain layer contains pure types that have no dependencies on I/O or
//! the async runtime, which makes them easy to test in isolation.
//!
//! # What belongs in the domain layer?
//!
//! - Configuration structures and their validation
//!
//! # What does NOT belong here?
//!
//! - Any `tokio` or `TcpStream` types
//! - Environment variable reading (that is done in `main.rs`)

pub mod config;

pub use config::{ConfigError, RelayConfig};
