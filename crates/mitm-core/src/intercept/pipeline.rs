//! One pass per packet: wrap, run the chain, decide.

use tracing::debug;

use crate::domain::game_state::SharedGameState;
use crate::events::{Event, EventBus};
use crate::intercept::handler::{HandlerContext, PacketSink};
use crate::intercept::interceptable::{Direction, InterceptablePacket, Verdict};
use crate::intercept::registry::HandlerRegistry;
use crate::protocol::packets::GamePacket;

/// The per-session interception pipeline.
///
/// Owns the session's registry, event bus and game state so that the relay
/// only has to hand it packets and a sink.  Clones share all three.
#[derive(Debug, Clone)]
pub struct PacketPipeline {
    registry: HandlerRegistry,
    events: EventBus,
    state: SharedGameState,
}

impl Default for PacketPipeline {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PacketPipeline {
    pub fn new(registry: HandlerRegistry, events: EventBus, state: SharedGameState) -> Self {
        Self {
            registry,
            events,
            state,
        }
    }

    /// A pipeline whose registry publishes toggles on its own bus.
    pub fn with_defaults() -> Self {
        let events = EventBus::new();
        Self::new(
            HandlerRegistry::with_events(events.clone()),
            events,
            SharedGameState::new(),
        )
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &SharedGameState {
        &self.state
    }

    /// Runs `packet` through every active handler for `direction`.
    ///
    /// Packets the handlers synthesize go to `sink`; they are never fed back
    /// into this pipeline.
    pub fn process(&self, direction: Direction, packet: GamePacket, sink: &dyn PacketSink) -> Verdict {
        let ctx = HandlerContext::new(sink, &self.registry, &self.events, &self.state);
        let mut wrapped = InterceptablePacket::new(packet, direction);
        let report = self.registry.run_chain(&mut wrapped, &ctx);

        if wrapped.is_intercepted() {
            debug!(
                "{direction}: {} intercepted after {} handler(s)",
                wrapped.packet().name(),
                report.invoked
            );
        } else if wrapped.was_replaced() {
            debug!("{direction}: forwarding replacement {}", wrapped.packet().name());
        }

        wrapped.into_verdict()
    }

    /// Session teardown: notify every handler, then publish
    /// [`Event::Disconnected`].
    pub fn notify_disconnect(&self, reason: &str) {
        self.registry.notify_disconnect(reason);
        self.events.emit(&Event::Disconnected {
            reason: reason.to_string(),
        });
    }
}
