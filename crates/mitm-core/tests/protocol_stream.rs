//! Integration tests for the mitm-core frame codec.
//!
//! These tests drive the codec the way a relay leg does: frames are built
//! from encoded packets, concatenated into a byte stream, and cut back apart
//! with `split_frame` before `decode_frame` turns them into packets.

use mitm_core::protocol::codec::{decode_frame, encode_packet, split_frame, CodecError, CodecState};
use mitm_core::protocol::packets::{
    AddEntityPacket, GamePacket, MovePlayerPacket, PlayerAuthInputPacket, TextKind, TextPacket,
    Vec3, FLAG_COMPRESSED, FRAME_HEADER_SIZE,
};

fn encode_all(packets: &[GamePacket]) -> Vec<Vec<u8>> {
    packets
        .iter()
        .map(|p| encode_packet(p).expect("encode must succeed"))
        .collect()
}

/// Cuts every complete frame from `stream` and decodes it.
fn decode_stream(stream: &[u8]) -> (Vec<GamePacket>, usize) {
    let mut packets = Vec::new();
    let mut off = 0;
    while let Some((frame, consumed)) = split_frame(&stream[off..]).expect("framing must hold") {
        for result in decode_frame(frame).expect("frame body must decode") {
            packets.push(result.expect("packet must decode"));
        }
        off += consumed;
    }
    (packets, off)
}

fn sample_batch() -> Vec<GamePacket> {
    vec![
        GamePacket::Text(TextPacket {
            kind: TextKind::Chat,
            source: "Steve".to_string(),
            message: "hello there".to_string(),
        }),
        GamePacket::AddEntity(AddEntityPacket {
            runtime_id: 77,
            entity_type: "minecraft:creeper".to_string(),
            position: Vec3::new(1.5, 64.0, -3.25),
        }),
        GamePacket::MovePlayer(MovePlayerPacket {
            runtime_id: 1,
            position: Vec3::new(0.0, 65.62, 0.0),
            pitch: 12.5,
            yaw: -90.0,
            on_ground: true,
        }),
        GamePacket::Unknown {
            id: 0x3A,
            payload: vec![9, 8, 7, 6],
        },
    ]
}

#[test]
fn test_stream_of_frames_preserves_packet_order() {
    // Arrange
    let state = CodecState::default();
    let batch = sample_batch();
    let mut stream = state.encode_frame(&encode_all(&batch[..2])).unwrap();
    stream.extend(state.encode_frame(&encode_all(&batch[2..])).unwrap());

    // Act
    let (decoded, consumed) = decode_stream(&stream);

    // Assert
    assert_eq!(decoded, batch);
    assert_eq!(consumed, stream.len());
}

#[test]
fn test_partial_frame_waits_for_more_bytes() {
    // Arrange
    let frame = CodecState::default()
        .encode_frame(&encode_all(&sample_batch()))
        .unwrap();

    // Act / Assert: every strict prefix is incomplete, never an error
    for cut in 0..frame.len() {
        assert!(matches!(split_frame(&frame[..cut]), Ok(None)), "cut at {cut}");
    }
    assert!(matches!(split_frame(&frame), Ok(Some((_, n))) if n == frame.len()));
}

#[test]
fn test_compression_switches_on_after_network_settings() {
    // Arrange
    let mut state = CodecState::default();
    let settings = GamePacket::NetworkSettings {
        compression_threshold: 1,
    };
    let announce = state.encode_frame(&encode_all(&[settings.clone()])).unwrap();
    state.observe_sent(&settings);

    // Act
    let compressed = state.encode_frame(&encode_all(&sample_batch())).unwrap();

    // Assert
    assert_eq!(announce[1] & FLAG_COMPRESSED, 0, "announcing frame is plain");
    assert_eq!(compressed[1] & FLAG_COMPRESSED, FLAG_COMPRESSED);
    let mut stream = announce;
    stream.extend(compressed);
    let (decoded, _) = decode_stream(&stream);
    assert_eq!(decoded[0], settings);
    assert_eq!(&decoded[1..], sample_batch().as_slice());
}

#[test]
fn test_small_body_below_threshold_stays_plain() {
    let state = CodecState {
        compression_threshold: Some(1024),
    };
    let frame = state
        .encode_frame(&encode_all(&[GamePacket::RemoveEntity { runtime_id: 5 }]))
        .unwrap();
    assert_eq!(frame[1] & FLAG_COMPRESSED, 0);
}

#[test]
fn test_malformed_packet_is_skipped_inside_frame() {
    // Arrange: a Text packet whose payload is truncated garbage, between two
    // good packets.  The length prefix covers exactly the bad payload.
    let good_a = encode_packet(&GamePacket::RemoveEntity { runtime_id: 1 }).unwrap();
    let bad = vec![0x02, 0x09, 0xFF];
    let good_b = encode_packet(&GamePacket::PlayerAuthInput(PlayerAuthInputPacket {
        position: Vec3::default(),
        tick: 40,
    }))
    .unwrap();
    let frame = CodecState::default()
        .encode_frame(&[good_a, bad, good_b])
        .unwrap();

    // Act
    let (raw, _) = split_frame(&frame).unwrap().unwrap();
    let results = decode_frame(raw).unwrap();

    // Assert
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CodecError::MalformedPayload { .. })));
    assert!(matches!(
        results[2],
        Ok(GamePacket::PlayerAuthInput(PlayerAuthInputPacket { tick: 40, .. }))
    ));
}

#[test]
fn test_bad_magic_is_a_framing_error() {
    let mut frame = CodecState::default()
        .encode_frame(&encode_all(&sample_batch()))
        .unwrap();
    frame[0] = 0x00;
    assert!(matches!(split_frame(&frame), Err(CodecError::BadMagic(0x00))));
}

#[test]
fn test_oversized_declared_body_is_rejected_before_buffering() {
    // Arrange: header only, claiming a body far above the limit
    let mut header = vec![0xFE, 0x00];
    header.extend_from_slice(&u32::MAX.to_be_bytes());
    assert_eq!(header.len(), FRAME_HEADER_SIZE);

    // Act / Assert
    assert!(matches!(
        split_frame(&header),
        Err(CodecError::OversizedFrame { .. })
    ));
}

#[test]
fn test_reserved_unknown_id_cannot_be_encoded() {
    let packet = GamePacket::Unknown {
        id: 0x09,
        payload: vec![],
    };
    assert_eq!(encode_packet(&packet), Err(CodecError::ReservedId(0x09)));
}
