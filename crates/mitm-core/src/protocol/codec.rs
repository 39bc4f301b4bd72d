//! Binary codec for game frames and the packets batched inside them.
//!
//! Wire format:
//! ```text
//! frame  := [magic 0xFE:1][flags:1][body_len:4 BE][body:body_len]
//! body   := packet*              (LZ4 size-prepended block when flags & 0x01)
//! packet := [len:varu32][id:varu32][payload]
//! ```
//! `len` covers the id and the payload.  Varints are unsigned LEB128.  Fixed
//! width fields inside payloads are little-endian; strings are varu32
//! length-prefixed UTF-8.
//!
//! Decoding is split in two steps so a malformed packet never costs more than
//! itself: [`split_frame`] cuts one frame off a byte stream, and
//! [`decode_frame`] returns one result per packet in that frame.

use thiserror::Error;

use crate::protocol::packets::{
    AddEntityPacket, GamePacket, MovePlayerPacket, PacketId, PlayerAuthInputPacket,
    SetEntityMotionPacket, StartGamePacket, TextKind, TextPacket, Vec3, FLAG_COMPRESSED,
    FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_BODY,
};

/// Upper bound for a decompressed frame body.
const MAX_DECOMPRESSED_BODY: usize = MAX_FRAME_BODY * 4;

/// Errors that can occur while encoding or decoding frames and packets.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The first byte of a frame is not [`FRAME_MAGIC`].
    #[error("bad frame magic: 0x{0:02X}")]
    BadMagic(u8),

    /// A frame declares (or would produce) a body above [`MAX_FRAME_BODY`].
    #[error("frame body of {declared} bytes exceeds limit of {max}")]
    OversizedFrame { declared: usize, max: usize },

    /// A compressed body could not be decompressed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// A packet length prefix points past the end of the frame body.
    #[error("packet length mismatch: prefix says {declared}, available is {available}")]
    PacketLengthMismatch { declared: usize, available: usize },

    /// A varint ran past its maximum width.
    #[error("varint exceeds {0} bytes")]
    VarIntTooLong(usize),

    /// The payload could not be parsed (field out of range, UTF-8 error, etc.).
    #[error("malformed {packet} payload: {reason}")]
    MalformedPayload { packet: &'static str, reason: String },

    /// An `Unknown` packet was given an id the codec models, which would make
    /// the receiver parse its raw payload as the modelled packet.
    #[error("unknown packet uses reserved id 0x{0:02X}")]
    ReservedId(u32),
}

// ── Codec state ───────────────────────────────────────────────────────────────

/// Per-leg encoder state.
///
/// Decoding never needs it: the frame flags say whether a body is
/// compressed.  Encoding compresses a body once it reaches the threshold
/// announced by the last `NetworkSettings` packet sent on the leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecState {
    /// Minimum body size that gets compressed; `None` until negotiated.
    pub compression_threshold: Option<u16>,
}

impl CodecState {
    /// Wraps already-encoded packets into one frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedFrame`] if the body would exceed
    /// [`MAX_FRAME_BODY`] on the wire, or if it is larger uncompressed than a
    /// reader agrees to decompress.
    pub fn encode_frame(&self, packets: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
        let body_len: usize = packets.iter().map(Vec::len).sum();
        if body_len > MAX_DECOMPRESSED_BODY {
            return Err(CodecError::OversizedFrame {
                declared: body_len,
                max: MAX_DECOMPRESSED_BODY,
            });
        }
        let mut body = Vec::with_capacity(body_len);
        for packet in packets {
            body.extend_from_slice(packet);
        }

        let (flags, body) = match self.compression_threshold {
            Some(threshold) if body.len() >= threshold as usize => {
                (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(&body))
            }
            _ => (0x00, body),
        };

        if body.len() > MAX_FRAME_BODY {
            return Err(CodecError::OversizedFrame {
                declared: body.len(),
                max: MAX_FRAME_BODY,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.push(FRAME_MAGIC);
        frame.push(flags);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Applies the side effects a packet has on the encoder once it has been
    /// written to the wire.
    pub fn observe_sent(&mut self, packet: &GamePacket) {
        if let GamePacket::NetworkSettings {
            compression_threshold,
        } = packet
        {
            self.compression_threshold = Some(*compression_threshold);
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One frame cut from a byte stream, still borrowing the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub flags: u8,
    pub body: &'a [u8],
}

impl RawFrame<'_> {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Cuts one complete frame off the front of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, and the frame plus the
/// number of bytes it occupies otherwise.
///
/// # Errors
///
/// Returns [`CodecError::BadMagic`] or [`CodecError::OversizedFrame`] when
/// the stream is out of sync.  Neither can be skipped safely, so callers
/// treat them as fatal for the connection.
pub fn split_frame(bytes: &[u8]) -> Result<Option<(RawFrame<'_>, usize)>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes[0] != FRAME_MAGIC {
        return Err(CodecError::BadMagic(bytes[0]));
    }
    if bytes.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let flags = bytes[1];
    let body_len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    if body_len > MAX_FRAME_BODY {
        return Err(CodecError::OversizedFrame {
            declared: body_len,
            max: MAX_FRAME_BODY,
        });
    }

    let total = FRAME_HEADER_SIZE + body_len;
    if bytes.len() < total {
        return Ok(None);
    }

    Ok(Some((
        RawFrame {
            flags,
            body: &bytes[FRAME_HEADER_SIZE..total],
        },
        total,
    )))
}

/// Decodes every packet in a frame.
///
/// Each packet gets its own result so one malformed packet does not take the
/// rest of the batch with it.  If a length prefix is inconsistent the walk
/// stops there and the last entry is the error.
///
/// # Errors
///
/// Returns [`CodecError::Decompression`] (or `OversizedFrame` for a
/// decompression bomb) when the body itself is unusable.
pub fn decode_frame(frame: RawFrame<'_>) -> Result<Vec<Result<GamePacket, CodecError>>, CodecError> {
    let decompressed;
    let body = if frame.is_compressed() {
        decompressed = decompress_body(frame.body)?;
        decompressed.as_slice()
    } else {
        frame.body
    };

    let mut results = Vec::new();
    let mut off = 0;
    while off < body.len() {
        match decode_packet(&body[off..]) {
            Ok((packet, consumed)) => {
                results.push(Ok(packet));
                off += consumed;
            }
            Err(CodecError::MalformedPayload { packet, reason }) => {
                // The length prefix was sound; skip just this packet.
                let (len, prefix) = read_varu32(&body[off..])?;
                results.push(Err(CodecError::MalformedPayload { packet, reason }));
                off += prefix + len as usize;
            }
            Err(e) => {
                results.push(Err(e));
                break;
            }
        }
    }
    Ok(results)
}

fn decompress_body(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    if body.len() < 4 {
        return Err(CodecError::Decompression(format!(
            "compressed body of {} bytes has no size prefix",
            body.len()
        )));
    }
    let claimed = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if claimed > MAX_DECOMPRESSED_BODY {
        return Err(CodecError::OversizedFrame {
            declared: claimed,
            max: MAX_DECOMPRESSED_BODY,
        });
    }
    lz4_flex::decompress_size_prepended(body).map_err(|e| CodecError::Decompression(e.to_string()))
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// Encodes one packet as `[len][id][payload]`.
///
/// # Errors
///
/// Returns [`CodecError::ReservedId`] for an `Unknown` packet that carries a
/// modelled id, and [`CodecError::OversizedFrame`] if the packet alone would
/// not fit in a frame.
///
/// # Examples
///
/// ```rust
/// use mitm_core::protocol::codec::{decode_packet, encode_packet};
/// use mitm_core::protocol::packets::GamePacket;
///
/// let packet = GamePacket::RemoveEntity { runtime_id: 42 };
/// let bytes = encode_packet(&packet).unwrap();
/// let (decoded, consumed) = decode_packet(&bytes).unwrap();
/// assert_eq!(decoded, packet);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_packet(packet: &GamePacket) -> Result<Vec<u8>, CodecError> {
    if let GamePacket::Unknown { id, .. } = packet {
        if PacketId::try_from(*id).is_ok() {
            return Err(CodecError::ReservedId(*id));
        }
    }

    let mut inner = Vec::new();
    write_varu32(&mut inner, packet.id());
    encode_payload(&mut inner, packet);

    if inner.len() > MAX_FRAME_BODY {
        return Err(CodecError::OversizedFrame {
            declared: inner.len(),
            max: MAX_FRAME_BODY,
        });
    }

    let mut buf = Vec::with_capacity(inner.len() + 5);
    write_varu32(&mut buf, inner.len() as u32);
    buf.extend_from_slice(&inner);
    Ok(buf)
}

/// Decodes one packet from the beginning of `bytes`.
///
/// Returns the packet and the number of bytes consumed, length prefix
/// included.
///
/// # Errors
///
/// Returns [`CodecError::PacketLengthMismatch`] when the prefix points past
/// the end of `bytes`, and [`CodecError::MalformedPayload`] when the payload
/// does not parse.  In the latter case the prefix is trustworthy and the
/// caller can skip the packet.
pub fn decode_packet(bytes: &[u8]) -> Result<(GamePacket, usize), CodecError> {
    let (len, prefix) = read_varu32(bytes)?;
    let len = len as usize;
    let available = bytes.len() - prefix;
    if available < len {
        return Err(CodecError::PacketLengthMismatch {
            declared: len,
            available,
        });
    }

    let inner = &bytes[prefix..prefix + len];
    let (id, id_len) = read_varu32(inner).map_err(|e| CodecError::MalformedPayload {
        packet: "header",
        reason: e.to_string(),
    })?;
    let payload = &inner[id_len..];

    let packet = match PacketId::try_from(id) {
        Ok(known) => decode_payload(known, payload)?,
        Err(()) => GamePacket::Unknown {
            id,
            payload: payload.to_vec(),
        },
    };
    Ok((packet, prefix + len))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(buf: &mut Vec<u8>, packet: &GamePacket) {
    match packet {
        GamePacket::Disconnect { message } => write_string(buf, message),
        GamePacket::Text(p) => {
            buf.push(p.kind as u8);
            write_string(buf, &p.source);
            write_string(buf, &p.message);
        }
        GamePacket::StartGame(p) => {
            write_varu64(buf, p.runtime_id);
            write_vec3(buf, &p.position);
        }
        GamePacket::AddEntity(p) => {
            write_varu64(buf, p.runtime_id);
            write_string(buf, &p.entity_type);
            write_vec3(buf, &p.position);
        }
        GamePacket::RemoveEntity { runtime_id } => write_varu64(buf, *runtime_id),
        GamePacket::MovePlayer(p) => {
            write_varu64(buf, p.runtime_id);
            write_vec3(buf, &p.position);
            buf.extend_from_slice(&p.pitch.to_le_bytes());
            buf.extend_from_slice(&p.yaw.to_le_bytes());
            buf.push(u8::from(p.on_ground));
        }
        GamePacket::SetEntityMotion(p) => {
            write_varu64(buf, p.runtime_id);
            write_vec3(buf, &p.motion);
        }
        GamePacket::NetworkSettings {
            compression_threshold,
        } => buf.extend_from_slice(&compression_threshold.to_le_bytes()),
        GamePacket::PlayerAuthInput(p) => {
            write_vec3(buf, &p.position);
            write_varu64(buf, p.tick);
        }
        GamePacket::RequestNetworkSettings { protocol_version } => {
            buf.extend_from_slice(&protocol_version.to_be_bytes())
        }
        GamePacket::Unknown { payload, .. } => buf.extend_from_slice(payload),
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(id: PacketId, payload: &[u8]) -> Result<GamePacket, CodecError> {
    let name = packet_name(id);
    let mut r = Reader::new(payload, name);
    let packet = match id {
        PacketId::Disconnect => GamePacket::Disconnect {
            message: r.string()?,
        },
        PacketId::Text => {
            let raw_kind = r.u8()?;
            let kind = TextKind::try_from(raw_kind)
                .map_err(|_| r.malformed(format!("unknown text kind: {raw_kind}")))?;
            GamePacket::Text(TextPacket {
                kind,
                source: r.string()?,
                message: r.string()?,
            })
        }
        PacketId::StartGame => GamePacket::StartGame(StartGamePacket {
            runtime_id: r.varu64()?,
            position: r.vec3()?,
        }),
        PacketId::AddEntity => GamePacket::AddEntity(AddEntityPacket {
            runtime_id: r.varu64()?,
            entity_type: r.string()?,
            position: r.vec3()?,
        }),
        PacketId::RemoveEntity => GamePacket::RemoveEntity {
            runtime_id: r.varu64()?,
        },
        PacketId::MovePlayer => GamePacket::MovePlayer(MovePlayerPacket {
            runtime_id: r.varu64()?,
            position: r.vec3()?,
            pitch: r.f32()?,
            yaw: r.f32()?,
            on_ground: r.u8()? != 0,
        }),
        PacketId::SetEntityMotion => GamePacket::SetEntityMotion(SetEntityMotionPacket {
            runtime_id: r.varu64()?,
            motion: r.vec3()?,
        }),
        PacketId::NetworkSettings => {
            let bytes = r.take(2)?;
            GamePacket::NetworkSettings {
                compression_threshold: u16::from_le_bytes([bytes[0], bytes[1]]),
            }
        }
        PacketId::PlayerAuthInput => GamePacket::PlayerAuthInput(PlayerAuthInputPacket {
            position: r.vec3()?,
            tick: r.varu64()?,
        }),
        PacketId::RequestNetworkSettings => {
            let bytes = r.take(4)?;
            GamePacket::RequestNetworkSettings {
                protocol_version: i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            }
        }
    };
    r.finish()?;
    Ok(packet)
}

fn packet_name(id: PacketId) -> &'static str {
    match id {
        PacketId::Disconnect => "Disconnect",
        PacketId::Text => "Text",
        PacketId::StartGame => "StartGame",
        PacketId::AddEntity => "AddEntity",
        PacketId::RemoveEntity => "RemoveEntity",
        PacketId::MovePlayer => "MovePlayer",
        PacketId::SetEntityMotion => "SetEntityMotion",
        PacketId::NetworkSettings => "NetworkSettings",
        PacketId::PlayerAuthInput => "PlayerAuthInput",
        PacketId::RequestNetworkSettings => "RequestNetworkSettings",
    }
}

/// Forward-only cursor over one packet payload.
struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
    packet: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], packet: &'static str) -> Self {
        Self {
            buf,
            off: 0,
            packet,
        }
    }

    fn malformed(&self, reason: String) -> CodecError {
        CodecError::MalformedPayload {
            packet: self.packet,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < self.off + n {
            return Err(self.malformed(format!(
                "need {n} bytes at offset {}, got {}",
                self.off,
                self.buf.len().saturating_sub(self.off)
            )));
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn vec3(&mut self) -> Result<Vec3, CodecError> {
        Ok(Vec3 {
            x: self.f32()?,
            y: self.f32()?,
            z: self.f32()?,
        })
    }

    fn varu64(&mut self) -> Result<u64, CodecError> {
        let (value, used) =
            read_varu64(&self.buf[self.off..]).map_err(|e| self.malformed(e.to_string()))?;
        self.off += used;
        Ok(value)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let (len, used) =
            read_varu32(&self.buf[self.off..]).map_err(|e| self.malformed(e.to_string()))?;
        self.off += used;
        let bytes = self.take(len as usize)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| self.malformed(format!("invalid UTF-8: {e}")))
    }

    /// Rejects trailing bytes so a wrong layout is not silently accepted.
    fn finish(&self) -> Result<(), CodecError> {
        if self.off != self.buf.len() {
            return Err(self.malformed(format!(
                "{} trailing bytes",
                self.buf.len() - self.off
            )));
        }
        Ok(())
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn write_varu32(buf: &mut Vec<u8>, value: u32) {
    write_varu64(buf, u64::from(value));
}

fn write_varu64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varu32(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    let (value, used) = read_varint(buf, 5)?;
    u32::try_from(value)
        .map(|v| (v, used))
        .map_err(|_| CodecError::VarIntTooLong(5))
}

fn read_varu64(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    read_varint(buf, 10)
}

fn read_varint(buf: &[u8], max_bytes: usize) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().take(max_bytes).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < max_bytes {
        Err(CodecError::InsufficientData {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(CodecError::VarIntTooLong(max_bytes))
    }
}

/// Writes a varu32 length prefix followed by the UTF-8 string bytes.
fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varu32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_vec3(buf: &mut Vec<u8>, v: &Vec3) {
    buf.extend_from_slice(&v.x.to_le_bytes());
    buf.extend_from_slice(&v.y.to_le_bytes());
    buf.extend_from_slice(&v.z.to_le_bytes());
}

// ── Tests ─────────────────────────────────────────────────────────────────────
