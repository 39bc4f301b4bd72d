//! All game packets understood by the relay.
//!
//! The relay models only the packets its system handlers need to read or
//! rewrite.  Everything else travels as [`GamePacket::Unknown`] with its raw
//! payload untouched, so the relay stays transparent for traffic it does not
//! understand.

// ── Protocol constants ────────────────────────────────────────────────────────

/// First byte of every frame on the wire.
pub const FRAME_MAGIC: u8 = 0xFE;

/// Size of the frame header: magic (1) + flags (1) + body length (4).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest frame body the codec accepts, in bytes (2 MiB).
pub const MAX_FRAME_BODY: usize = 2 * 1024 * 1024;

/// Frame flag: the body is an LZ4 block with a 4-byte size prefix.
pub const FLAG_COMPRESSED: u8 = 0x01;

// ── Packet identifiers ────────────────────────────────────────────────────────

/// Packet ids of every modelled packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketId {
    Disconnect = 0x05,
    Text = 0x09,
    StartGame = 0x0B,
    AddEntity = 0x0D,
    RemoveEntity = 0x0E,
    MovePlayer = 0x13,
    SetEntityMotion = 0x28,
    NetworkSettings = 0x8F,
    PlayerAuthInput = 0x90,
    RequestNetworkSettings = 0xC1,
}

impl TryFrom<u32> for PacketId {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            0x05 => Ok(PacketId::Disconnect),
            0x09 => Ok(PacketId::Text),
            0x0B => Ok(PacketId::StartGame),
            0x0D => Ok(PacketId::AddEntity),
            0x0E => Ok(PacketId::RemoveEntity),
            0x13 => Ok(PacketId::MovePlayer),
            0x28 => Ok(PacketId::SetEntityMotion),
            0x8F => Ok(PacketId::NetworkSettings),
            0x90 => Ok(PacketId::PlayerAuthInput),
            0xC1 => Ok(PacketId::RequestNetworkSettings),
            _ => Err(()),
        }
    }
}

// ── Shared field types ────────────────────────────────────────────────────────

/// A position or motion vector in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Vec3) -> f32 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Category of a chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TextKind {
    Raw = 0x00,
    Chat = 0x01,
    System = 0x06,
    Whisper = 0x07,
    Announcement = 0x08,
}

impl TryFrom<u8> for TextKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TextKind::Raw),
            0x01 => Ok(TextKind::Chat),
            0x06 => Ok(TextKind::System),
            0x07 => Ok(TextKind::Whisper),
            0x08 => Ok(TextKind::Announcement),
            _ => Err(()),
        }
    }
}

// ── Per-packet payload structs ────────────────────────────────────────────────

/// TEXT (0x09): a chat line, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPacket {
    pub kind: TextKind,
    /// Sender display name; empty for system lines.
    pub source: String,
    pub message: String,
}

impl TextPacket {
    /// Builds a system line addressed to the local player.
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: TextKind::System,
            source: String::new(),
            message: message.into(),
        }
    }
}

/// START_GAME (0x0B): server tells the client its own runtime id and spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct StartGamePacket {
    pub runtime_id: u64,
    pub position: Vec3,
}

/// ADD_ENTITY (0x0D): an entity entered the client's view.
#[derive(Debug, Clone, PartialEq)]
pub struct AddEntityPacket {
    pub runtime_id: u64,
    /// Namespaced identifier such as `minecraft:zombie`.
    pub entity_type: String,
    pub position: Vec3,
}

/// MOVE_PLAYER (0x13): absolute player movement, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct MovePlayerPacket {
    pub runtime_id: u64,
    pub position: Vec3,
    pub pitch: f32,
    pub yaw: f32,
    pub on_ground: bool,
}

/// SET_ENTITY_MOTION (0x28): server-applied velocity.
#[derive(Debug, Clone, PartialEq)]
pub struct SetEntityMotionPacket {
    pub runtime_id: u64,
    pub motion: Vec3,
}

/// PLAYER_AUTH_INPUT (0x90): the client's per-tick input and position.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerAuthInputPacket {
    pub position: Vec3,
    pub tick: u64,
}

// ── Top-level packet enum ─────────────────────────────────────────────────────

/// One decoded protocol message.
///
/// Packets are plain values: handlers rewrite them by building a new value
/// and handing it to `InterceptablePacket::replace`.
#[derive(Debug, Clone, PartialEq)]
pub enum GamePacket {
    Disconnect { message: String },
    Text(TextPacket),
    StartGame(StartGamePacket),
    AddEntity(AddEntityPacket),
    RemoveEntity { runtime_id: u64 },
    MovePlayer(MovePlayerPacket),
    SetEntityMotion(SetEntityMotionPacket),
    NetworkSettings { compression_threshold: u16 },
    PlayerAuthInput(PlayerAuthInputPacket),
    RequestNetworkSettings { protocol_version: i32 },
    /// Any packet id the relay does not model, carried verbatim.
    Unknown { id: u32, payload: Vec<u8> },
}

impl GamePacket {
    /// Returns the numeric wire id of this packet.
    pub fn id(&self) -> u32 {
        match self {
            GamePacket::Unknown { id, .. } => *id,
            other => other.packet_id().map(|id| id as u32).unwrap_or_default(),
        }
    }

    /// Returns the [`PacketId`] for modelled packets, `None` for
    /// [`GamePacket::Unknown`].
    pub fn packet_id(&self) -> Option<PacketId> {
        let id = match self {
            GamePacket::Disconnect { .. } => PacketId::Disconnect,
            GamePacket::Text(_) => PacketId::Text,
            GamePacket::StartGame(_) => PacketId::StartGame,
            GamePacket::AddEntity(_) => PacketId::AddEntity,
            GamePacket::RemoveEntity { .. } => PacketId::RemoveEntity,
            GamePacket::MovePlayer(_) => PacketId::MovePlayer,
            GamePacket::SetEntityMotion(_) => PacketId::SetEntityMotion,
            GamePacket::NetworkSettings { .. } => PacketId::NetworkSettings,
            GamePacket::PlayerAuthInput(_) => PacketId::PlayerAuthInput,
            GamePacket::RequestNetworkSettings { .. } => PacketId::RequestNetworkSettings,
            GamePacket::Unknown { .. } => return None,
        };
        Some(id)
    }

    /// Short variant name for log lines; never includes field values.
    pub fn name(&self) -> &'static str {
        match self {
            GamePacket::Disconnect { .. } => "Disconnect",
            GamePacket::Text(_) => "Text",
            GamePacket::StartGame(_) => "StartGame",
            GamePacket::AddEntity(_) => "AddEntity",
            GamePacket::RemoveEntity { .. } => "RemoveEntity",
            GamePacket::MovePlayer(_) => "MovePlayer",
            GamePacket::SetEntityMotion(_) => "SetEntityMotion",
            GamePacket::NetworkSettings { .. } => "NetworkSettings",
            GamePacket::PlayerAuthInput(_) => "PlayerAuthInput",
            GamePacket::RequestNetworkSettings { .. } => "RequestNetworkSettings",
            GamePacket::Unknown { .. } => "Unknown",
        }
    }
}
