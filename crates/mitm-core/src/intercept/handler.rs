//! The handler contract: what a module implements and what it gets to use.
//!
//! A handler sees each packet through [`PacketHandler::handle`].  Its only
//! levers on the packet are `intercept()` and `replace()`; everything else
//! (injecting packets, scheduling delayed work, notifying other modules) goes
//! through the [`HandlerContext`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::domain::game_state::SharedGameState;
use crate::events::EventBus;
use crate::intercept::interceptable::{Direction, InterceptablePacket};
use crate::intercept::registry::HandlerRegistry;
use crate::protocol::packets::GamePacket;

/// Failure reported by a handler or an event listener.
///
/// The chain logs it and moves on; it never reaches the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    /// Converts a `catch_unwind` payload into an error value.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HandlerError::Panicked(message)
    }
}

/// Background work handed to [`PacketSink::spawn_worker`].
pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Send path for synthesized packets.
///
/// Packets given to a sink go straight to the destination leg's send queue
/// and never pass through the handler chain.  `direction` names where the
/// packet is going: [`Direction::Outbound`] reaches the server,
/// [`Direction::Inbound`] reaches the client.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSink: Send + Sync {
    /// Queues `packet` for immediate transmission.
    fn send(&self, direction: Direction, packet: GamePacket);

    /// Queues `packet` after `delay` without blocking the caller.
    fn send_after(&self, delay: Duration, direction: Direction, packet: GamePacket);

    /// Runs `work` on the session's worker set.  It is cancelled when the
    /// session closes.
    fn spawn_worker(&self, name: &str, work: WorkerFuture);
}

/// Everything a handler may touch besides the packet itself.
///
/// `registry` is the registry running the current pass.  Handlers may
/// register, unregister or toggle through it; changes apply from the next
/// packet.
pub struct HandlerContext<'a> {
    pub sink: &'a dyn PacketSink,
    pub registry: &'a HandlerRegistry,
    pub events: &'a EventBus,
    pub state: &'a SharedGameState,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        sink: &'a dyn PacketSink,
        registry: &'a HandlerRegistry,
        events: &'a EventBus,
        state: &'a SharedGameState,
    ) -> Self {
        Self {
            sink,
            registry,
            events,
            state,
        }
    }

    /// Sends a packet to the client.
    pub fn send_to_client(&self, packet: GamePacket) {
        self.sink.send(Direction::Inbound, packet);
    }

    /// Sends a packet to the server.
    pub fn send_to_server(&self, packet: GamePacket) {
        self.sink.send(Direction::Outbound, packet);
    }
}

/// One unit of per-packet logic contributed by a module.
///
/// Handlers are shared between the two pump tasks, so any state they keep
/// needs interior mutability.
///
/// Closures with the right signature are handlers too; wrap them in
/// [`handler_fn`] so the argument types are inferred:
///
/// ```rust
/// use mitm_core::intercept::handler::{handler_fn, PacketHandler};
///
/// fn assert_handler<H: PacketHandler>(_: H) {}
///
/// assert_handler(handler_fn(|packet, _ctx| {
///     if packet.packet().name() == "Disconnect" {
///         packet.intercept();
///     }
///     Ok(())
/// }));
/// ```
pub trait PacketHandler: Send + Sync {
    /// Inspects one packet.  May call `intercept()` or `replace()`.
    fn handle(
        &self,
        packet: &mut InterceptablePacket,
        ctx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError>;

    /// Called once when the session ends.  Release timers and background
    /// loops here.
    fn on_disconnect(&self, _reason: &str) {}
}

impl<F> PacketHandler for F
where
    F: Fn(&mut InterceptablePacket, &HandlerContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(
        &self,
        packet: &mut InterceptablePacket,
        ctx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        self(packet, ctx)
    }
}

/// Pins a closure to the handler signature.
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&mut InterceptablePacket, &HandlerContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    f
}
