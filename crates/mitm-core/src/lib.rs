//! # mitm-core
//!
//! Shared library for the block-game MITM relay: the packet codec, the
//! interception chain, the event bus and the tracked game state.
//!
//! It has no dependency on sockets or an async runtime; the `mitm-relay`
//! crate supplies those.
//!
//! # Architecture overview (for beginners)
//!
//! The relay sits between a game client and a game server.  Every packet
//! either side sends is decoded, shown to a chain of handlers, and then
//! re-encoded and forwarded (or dropped).  Handlers belong to "modules":
//! pieces of gameplay logic that can watch, rewrite, suppress or invent
//! packets.
//!
//! - **`protocol`** – How bytes travel over the network.  Frames hold one or
//!   more packets, optionally LZ4-compressed, and decode into the closed
//!   [`GamePacket`] enum.
//!
//! - **`intercept`** – The handler contract.  [`InterceptablePacket`] carries
//!   one packet through one pass, [`HandlerRegistry`] keeps handlers in
//!   order, and [`PacketPipeline`] runs a pass and returns a [`Verdict`].
//!
//! - **`events`** – A synchronous bus for notifications that are not tied to
//!   a packet (ticks, module toggles, redraws, disconnects).
//!
//! - **`domain`** – What the relay knows about the game world, rebuilt from
//!   the packets it has seen.

pub mod domain;
pub mod events;
pub mod intercept;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `mitm_core::GamePacket` instead of `mitm_core::protocol::packets::GamePacket`.
pub use domain::game_state::{GameState, SharedGameState, TrackedEntity};
pub use events::{Event, EventBus, EventKind};
pub use intercept::{
    Direction, HandlerContext, HandlerError, HandlerRegistry, InterceptablePacket, PacketHandler,
    PacketPipeline, PacketSink, Verdict,
};
pub use protocol::codec::{CodecError, CodecState};
pub use protocol::packets::GamePacket;
