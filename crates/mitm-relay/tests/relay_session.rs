//! End-to-end session tests over in-memory pipes.
//!
//! Each test plays both the game client and the game server: it writes
//! frames into one end of the relay and reads what comes out the other.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use mitm_core::events::{listener_fn, Event, EventKind};
use mitm_core::intercept::{
    handler_fn, Direction, HandlerContext, HandlerError, InterceptablePacket, PacketHandler,
    PacketPipeline,
};
use mitm_core::protocol::codec::{decode_frame, encode_packet, split_frame, CodecState};
use mitm_core::protocol::packets::{
    GamePacket, MovePlayerPacket, StartGamePacket, TextKind, TextPacket, Vec3,
};
use mitm_relay::application::install_system_handlers;
use mitm_relay::infrastructure::{
    CloseReason, Endpoint, RelaySession, SessionHandle, SessionOutcome, SessionSettings,
    SessionState,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    /// The test's end of the client connection.
    client: DuplexStream,
    /// The test's end of the server connection.
    server: DuplexStream,
    handle: SessionHandle,
    task: JoinHandle<SessionOutcome>,
}

impl Harness {
    fn start(pipeline: PacketPipeline) -> Self {
        Self::start_with(pipeline, SessionSettings::default())
    }

    fn start_with(pipeline: PacketPipeline, settings: SessionSettings) -> Self {
        let (client, relay_client_side) = duplex(256 * 1024);
        let (server, relay_server_side) = duplex(256 * 1024);
        let addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let session = RelaySession::new(addr, addr, settings, pipeline);
        let handle = session.handle();
        let task = tokio::spawn(session.run(relay_client_side, relay_server_side));
        Self {
            client,
            server,
            handle,
            task,
        }
    }

    async fn outcome(self) -> SessionOutcome {
        timeout(WAIT, self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}

fn frame(packets: &[GamePacket]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = packets.iter().map(|p| encode_packet(p).unwrap()).collect();
    CodecState::default().encode_frame(&encoded).unwrap()
}

async fn send(stream: &mut DuplexStream, packets: &[GamePacket]) {
    stream.write_all(&frame(packets)).await.unwrap();
}

/// Reads until exactly `count` packets have arrived.
async fn recv(stream: &mut DuplexStream, count: usize) -> Vec<GamePacket> {
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    while out.len() < count {
        while let Some((raw, consumed)) = split_frame(&buf).unwrap() {
            let decoded = decode_frame(raw).unwrap();
            buf.drain(..consumed);
            out.extend(decoded.into_iter().map(Result::unwrap));
        }
        if out.len() >= count {
            break;
        }
        let n = timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for packets")
            .unwrap();
        assert!(n > 0, "stream closed after {} packets", out.len());
        buf.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(out.len(), count, "more packets than expected");
    out
}

fn chat(message: &str) -> GamePacket {
    GamePacket::Text(TextPacket {
        kind: TextKind::Chat,
        source: "Steve".to_string(),
        message: message.to_string(),
    })
}

fn entity(runtime_id: u64) -> GamePacket {
    GamePacket::RemoveEntity { runtime_id }
}

fn moved(on_ground: bool) -> GamePacket {
    GamePacket::MovePlayer(MovePlayerPacket {
        runtime_id: 1,
        position: Vec3::new(0.0, 64.0, 0.0),
        pitch: 0.0,
        yaw: 90.0,
        on_ground,
    })
}

// ── Forwarding ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_packets_are_relayed_in_order_both_ways() {
    // Arrange
    let mut h = Harness::start(PacketPipeline::with_defaults());
    let upstream: Vec<GamePacket> = (0..5).map(entity).collect();
    let downstream: Vec<GamePacket> = (10..13).map(entity).collect();

    // Act
    send(&mut h.client, &upstream[..2]).await;
    send(&mut h.client, &upstream[2..]).await;
    send(&mut h.server, &downstream).await;

    // Assert
    assert_eq!(recv(&mut h.server, 5).await, upstream);
    assert_eq!(recv(&mut h.client, 3).await, downstream);
    assert_eq!(h.handle.state(), SessionState::Active);
}

#[tokio::test]
async fn test_replaced_packet_is_what_reaches_the_server() {
    // Arrange: a "no-fall" module forcing on_ground
    let pipeline = PacketPipeline::with_defaults();
    pipeline.registry().register(
        "no-fall",
        Direction::Outbound,
        handler_fn(|packet, _ctx| {
            if let GamePacket::MovePlayer(mv) = packet.packet() {
                let mut mv = mv.clone();
                mv.on_ground = true;
                packet.replace(GamePacket::MovePlayer(mv));
            }
            Ok(())
        }),
    );
    let mut h = Harness::start(pipeline);

    // Act
    send(&mut h.client, &[moved(false)]).await;

    // Assert
    assert_eq!(recv(&mut h.server, 1).await, vec![moved(true)]);
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_help_command_is_answered_and_never_reaches_server() {
    // Arrange
    let pipeline = PacketPipeline::with_defaults();
    install_system_handlers(&pipeline, "!");
    let mut h = Harness::start(pipeline);

    // Act
    send(&mut h.client, &[chat("!help"), chat("hello")]).await;

    // Assert: the reply is a system line to the client
    let reply = recv(&mut h.client, 1).await;
    match &reply[0] {
        GamePacket::Text(text) => {
            assert_eq!(text.kind, TextKind::System);
            assert!(text.message.contains("!toggle"));
        }
        other => panic!("expected a chat reply, got {other:?}"),
    }
    // Only the plain chat line went upstream.
    assert_eq!(recv(&mut h.server, 1).await, vec![chat("hello")]);

    h.handle.close();
    let outcome = h.outcome().await;
    assert_eq!(outcome.stats.intercepted, 1);
    assert_eq!(outcome.stats.synthesized, 1);
}

// ── Synthesized packets ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_handler_can_inject_packets_into_either_leg() {
    // Arrange: on StartGame, greet the player and announce to the server
    let pipeline = PacketPipeline::with_defaults();
    pipeline.registry().register(
        "greeter",
        Direction::Inbound,
        handler_fn(|packet, ctx| {
            if let GamePacket::StartGame(_) = packet.packet() {
                ctx.send_to_client(GamePacket::Text(TextPacket::system("welcome")));
                ctx.send_to_server(chat("relay attached"));
            }
            Ok(())
        }),
    );
    let mut h = Harness::start(pipeline);
    let start = GamePacket::StartGame(StartGamePacket {
        runtime_id: 1,
        position: Vec3::default(),
    });

    // Act
    send(&mut h.server, &[start.clone()]).await;

    // Assert: the greeting is queued before the StartGame that triggered it
    let to_client = recv(&mut h.client, 2).await;
    assert_eq!(to_client[0], GamePacket::Text(TextPacket::system("welcome")));
    assert_eq!(to_client[1], start);
    assert_eq!(recv(&mut h.server, 1).await, vec![chat("relay attached")]);
}

#[tokio::test]
async fn test_delayed_send_arrives_later() {
    // Arrange
    let pipeline = PacketPipeline::with_defaults();
    pipeline.registry().register(
        "echo-later",
        Direction::Outbound,
        handler_fn(|packet, ctx| {
            if let GamePacket::Text(_) = packet.packet() {
                ctx.sink.send_after(
                    Duration::from_millis(50),
                    Direction::Inbound,
                    GamePacket::Text(TextPacket::system("later")),
                );
            }
            Ok(())
        }),
    );
    let mut h = Harness::start(pipeline);

    // Act
    send(&mut h.client, &[chat("ping")]).await;

    // Assert
    assert_eq!(recv(&mut h.server, 1).await, vec![chat("ping")]);
    assert_eq!(
        recv(&mut h.client, 1).await,
        vec![GamePacket::Text(TextPacket::system("later"))]
    );
}

// ── Failure isolation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_panicking_handler_does_not_break_session() {
    // Arrange
    let pipeline = PacketPipeline::with_defaults();
    pipeline.registry().register(
        "broken",
        Direction::Outbound,
        handler_fn(|_, _| panic!("module bug")),
    );
    let mut h = Harness::start(pipeline);

    // Act
    send(&mut h.client, &[entity(1)]).await;
    send(&mut h.client, &[entity(2)]).await;

    // Assert
    assert_eq!(recv(&mut h.server, 2).await, vec![entity(1), entity(2)]);
    assert_eq!(h.handle.state(), SessionState::Active);
}

#[tokio::test]
async fn test_panicking_condition_does_not_break_session() {
    // Arrange
    let pipeline = PacketPipeline::with_defaults();
    pipeline.registry().register_when(
        "bad-condition",
        Direction::Outbound,
        |_: &GamePacket| -> bool { panic!("condition bug") },
        handler_fn(|packet, _| {
            packet.intercept();
            Ok(())
        }),
    );
    let mut h = Harness::start(pipeline);

    // Act
    send(&mut h.client, &[entity(1)]).await;

    // Assert: skipped handler, packet forwarded, session alive
    assert_eq!(recv(&mut h.server, 1).await, vec![entity(1)]);
    assert_eq!(h.handle.state(), SessionState::Active);
}

#[tokio::test]
async fn test_undecodable_packet_is_skipped() {
    // Arrange: a TEXT packet with a truncated payload, between two good ones
    let mut h = Harness::start(PacketPipeline::with_defaults());
    let good = encode_packet(&entity(1)).unwrap();
    let bad = vec![0x02, 0x09, 0xFF];
    let body = CodecState::default()
        .encode_frame(&[good.clone(), bad, good])
        .unwrap();

    // Act
    h.client.write_all(&body).await.unwrap();

    // Assert
    assert_eq!(recv(&mut h.server, 2).await, vec![entity(1), entity(1)]);
    h.handle.close();
    assert_eq!(h.outcome().await.stats.decode_errors, 1);
}

// ── Teardown ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DisconnectProbe {
    calls: AtomicUsize,
    reason: Mutex<Option<String>>,
}

impl PacketHandler for DisconnectProbe {
    fn handle(
        &self,
        _packet: &mut InterceptablePacket,
        _ctx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_disconnect(&self, reason: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.reason.lock().unwrap() = Some(reason.to_string());
    }
}

#[tokio::test]
async fn test_idle_leg_closes_session_and_notifies_handlers() {
    // Arrange
    let pipeline = PacketPipeline::with_defaults();
    let probe = Arc::new(DisconnectProbe::default());
    pipeline.registry().register_shared(
        "probe",
        &[Direction::Inbound, Direction::Outbound],
        probe.clone(),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    pipeline.events().subscribe(
        EventKind::Disconnected,
        listener_fn(move |event, _| {
            log.lock().unwrap().push(event.clone());
            Ok(())
        }),
    );
    let settings = SessionSettings {
        idle_timeout: Duration::from_millis(100),
        ..SessionSettings::default()
    };
    let h = Harness::start_with(pipeline, settings);
    let handle = h.handle.clone();

    // Act: say nothing
    let outcome = h.outcome().await;

    // Assert
    assert!(matches!(outcome.reason, CloseReason::IdleTimeout(_)));
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 1, "once per handler, not per direction");
    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::Disconnected {
            reason: outcome.reason.to_string()
        }]
    );
}

#[tokio::test]
async fn test_client_hangup_ends_session() {
    // Arrange
    let h = Harness::start(PacketPipeline::with_defaults());
    let Harness {
        client,
        server: _server,
        task,
        ..
    } = h;

    // Act
    drop(client);
    let outcome = timeout(WAIT, task).await.unwrap().unwrap();

    // Assert
    assert_eq!(outcome.reason, CloseReason::PeerClosed(Endpoint::Client));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_packet_before_server_hangup_reaches_client() {
    for _ in 0..50 {
        // Arrange
        let h = Harness::start(PacketPipeline::with_defaults());
        let Harness {
            mut client,
            mut server,
            task,
            ..
        } = h;
        let kick = GamePacket::Disconnect {
            message: "kicked".to_string(),
        };

        // Act: the server says goodbye and closes at once
        send(&mut server, &[kick.clone()]).await;
        drop(server);
        let outcome = timeout(WAIT, task).await.unwrap().unwrap();

        // Assert
        assert_eq!(outcome.reason, CloseReason::PeerClosed(Endpoint::Server));
        assert_eq!(recv(&mut client, 1).await, vec![kick]);
    }
}

#[tokio::test]
async fn test_close_hangs_up_server_leg_after_flush() {
    // Arrange
    let mut h = Harness::start(PacketPipeline::with_defaults());
    let burst: Vec<GamePacket> = (0..20).map(entity).collect();
    send(&mut h.client, &burst).await;
    assert_eq!(recv(&mut h.server, 20).await, burst);

    // Act
    h.handle.close();
    let Harness { mut server, task, .. } = h;
    timeout(WAIT, task).await.unwrap().unwrap();

    // Assert: after the flush the relay hangs up on the server
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_garbage_from_server_is_fatal() {
    // Arrange
    let mut h = Harness::start(PacketPipeline::with_defaults());

    // Act
    h.server.write_all(b"HTTP/1.1 400 Bad Request\r\n").await.unwrap();

    // Assert
    let outcome = h.outcome().await;
    assert!(matches!(
        outcome.reason,
        CloseReason::Framing {
            endpoint: Endpoint::Server,
            ..
        }
    ));
}

#[tokio::test]
async fn test_close_handle_stops_running_session() {
    // Arrange
    let h = Harness::start(PacketPipeline::with_defaults());
    let handle = h.handle.clone();

    // Act
    assert!(handle.close());
    let outcome = h.outcome().await;

    // Assert
    assert_eq!(outcome.reason, CloseReason::Requested);
    assert_eq!(handle.state(), SessionState::Closed);
    assert!(!handle.close(), "second close is a no-op");
}
