//! Domain entities for the relay.
//!
//! This module contains pure data with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain**.  Domain code has no imports from sockets,
//! async runtimes or UI frameworks, so it can be tested on any platform
//! without setup.  Here that means the picture of the game world that the
//! relay rebuilds from the packets flowing through it.

/// Tracked world state shared by all handlers of a session.
///
/// See [`game_state::GameState`] for the main type.
pub mod game_state;
