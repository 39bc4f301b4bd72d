//! Protocol module containing packet types and the binary codec.

pub mod codec;
pub mod packets;

pub use codec::{decode_frame, decode_packet, encode_packet, split_frame, CodecError, CodecState};
pub use packets::*;
