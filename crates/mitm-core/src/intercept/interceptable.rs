//! The per-pass packet wrapper handed to every handler.
//!
//! An [`InterceptablePacket`] exists for exactly one trip through the handler
//! chain.  It is deliberately not `Clone`: the pass owns the only copy, and
//! [`InterceptablePacket::into_verdict`] consumes it when the relay makes its
//! forward/drop decision.

use crate::protocol::packets::GamePacket;

/// Which way a packet is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client → server.
    Outbound,
    /// Server → client.
    Inbound,
}

impl Direction {
    /// The direction a reply to this packet would travel.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "client→server",
            Direction::Inbound => "server→client",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one pipeline pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Encode this packet (possibly a replacement) and send it on.
    Forward(GamePacket),
    /// A handler intercepted the packet; nothing is sent.
    Drop,
}

/// One decoded packet plus its interception flag, for a single pass.
#[derive(Debug)]
pub struct InterceptablePacket {
    packet: GamePacket,
    direction: Direction,
    intercepted: bool,
    replaced: bool,
}

impl InterceptablePacket {
    pub fn new(packet: GamePacket, direction: Direction) -> Self {
        Self {
            packet,
            direction,
            intercepted: false,
            replaced: false,
        }
    }

    /// The current packet: the original, or the latest replacement.
    pub fn packet(&self) -> &GamePacket {
        &self.packet
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Marks the packet for suppression.  Idempotent, and there is no way to
    /// clear the flag again within the pass.
    pub fn intercept(&mut self) {
        self.intercepted = true;
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    /// Swaps in a new packet for every handler downstream and for encoding.
    ///
    /// Returns the packet that was replaced.  Replacing does not touch the
    /// interception flag.
    pub fn replace(&mut self, packet: GamePacket) -> GamePacket {
        self.replaced = true;
        std::mem::replace(&mut self.packet, packet)
    }

    /// `true` once any handler has called [`replace`](Self::replace).
    pub fn was_replaced(&self) -> bool {
        self.replaced
    }

    /// Ends the pass.
    pub fn into_verdict(self) -> Verdict {
        if self.intercepted {
            Verdict::Drop
        } else {
            Verdict::Forward(self.packet)
        }
    }
}
