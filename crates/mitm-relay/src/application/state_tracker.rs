//! The state tracker: rebuilds [`GameState`] from the traffic it observes.
//!
//! Registered first in both directions so every module downstream sees an
//! up-to-date picture.  It never intercepts or replaces anything.
//!
//! It also drives the periodic events:
//!
//! - [`Event::Tick`] for every `PlayerAuthInput` (the client sends one per
//!   game tick).
//! - [`Event::Render`] on a tick when tracked state changed since the last
//!   render, or when a listener asked for a follow-up on the previous one.

use std::sync::atomic::{AtomicBool, Ordering};

use mitm_core::domain::game_state::{GameState, TrackedEntity};
use mitm_core::events::Event;
use mitm_core::intercept::{HandlerContext, HandlerError, InterceptablePacket, PacketHandler};
use mitm_core::protocol::packets::{GamePacket, Vec3};
use tracing::debug;

#[derive(Debug, Default)]
pub struct StateTracker {
    /// Tracked state changed since the last `Render`.
    dirty: AtomicBool,
    /// A listener requested another `Render`.
    follow_up: AtomicBool,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketHandler for StateTracker {
    fn handle(
        &self,
        packet: &mut InterceptablePacket,
        ctx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        // The write guard must be gone before any event is emitted: listeners
        // are free to read the state.
        let changed = apply_packet(&mut ctx.state.write(), packet.packet());
        if changed {
            self.dirty.store(true, Ordering::Release);
        }

        if let GamePacket::PlayerAuthInput(input) = packet.packet() {
            ctx.events.emit(&Event::Tick { tick: input.tick });

            let dirty = self.dirty.swap(false, Ordering::AcqRel);
            let requested = self.follow_up.swap(false, Ordering::AcqRel);
            if dirty || requested {
                let delivery = ctx.events.emit(&Event::Render);
                self.follow_up.store(delivery.follow_up, Ordering::Release);
            }
        }
        Ok(())
    }

    fn on_disconnect(&self, reason: &str) {
        debug!("state tracker reset ({reason})");
        self.dirty.store(false, Ordering::Release);
        self.follow_up.store(false, Ordering::Release);
    }
}

/// Folds one packet into `state`.  Returns `true` if anything changed.
pub fn apply_packet(state: &mut GameState, packet: &GamePacket) -> bool {
    match packet {
        GamePacket::StartGame(start) => {
            state.local_player.runtime_id = Some(start.runtime_id);
            set_local_position(state, start.position)
        }
        GamePacket::PlayerAuthInput(input) => {
            state.local_player.last_tick = Some(input.tick);
            set_local_position(state, input.position)
        }
        GamePacket::MovePlayer(mv) => {
            if state.local_player.runtime_id == Some(mv.runtime_id) {
                set_local_position(state, mv.position)
            } else {
                state.move_entity(mv.runtime_id, mv.position)
            }
        }
        GamePacket::AddEntity(add) => state.upsert_entity(TrackedEntity {
            runtime_id: add.runtime_id,
            entity_type: add.entity_type.clone(),
            position: add.position,
            motion: Vec3::default(),
        }),
        GamePacket::RemoveEntity { runtime_id } => state.remove_entity(*runtime_id).is_some(),
        GamePacket::SetEntityMotion(motion) => {
            state.set_entity_motion(motion.runtime_id, motion.motion)
        }
        _ => false,
    }
}

fn set_local_position(state: &mut GameState, position: Vec3) -> bool {
    let changed = state.local_player.position != Some(position);
    state.local_player.position = Some(position);
    changed
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mitm_core::events::{listener_fn, EventKind};
    use mitm_core::intercept::{Direction, PacketPipeline, PacketSink, WorkerFuture};
    use mitm_core::protocol::packets::{
        AddEntityPacket, MovePlayerPacket, PlayerAuthInputPacket, SetEntityMotionPacket,
        StartGamePacket,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct NullSink;

    impl PacketSink for NullSink {
        fn send(&self, _: Direction, _: GamePacket) {}
        fn send_after(&self, _: Duration, _: Direction, _: GamePacket) {}
        fn spawn_worker(&self, _: &str, _: WorkerFuture) {}
    }

    fn tracked_pipeline() -> PacketPipeline {
        let pipeline = PacketPipeline::with_defaults();
        pipeline.registry().register_shared(
            "state-tracker",
            &[Direction::Inbound, Direction::Outbound],
            Arc::new(StateTracker::new()),
        );
        pipeline
    }

    fn record_events(pipeline: &PacketPipeline, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        pipeline.events().subscribe(
            kind,
            listener_fn(move |event, _| {
                sink.lock().unwrap().push(event.clone());
                Ok(())
            }),
        );
        log
    }

    fn auth_input(tick: u64, x: f32) -> GamePacket {
        GamePacket::PlayerAuthInput(PlayerAuthInputPacket {
            position: Vec3::new(x, 64.0, 0.0),
            tick,
        })
    }

    #[test]
    fn test_start_game_sets_local_player() {
        // Arrange
        let mut state = GameState::default();
        let packet = GamePacket::StartGame(StartGamePacket {
            runtime_id: 42,
            position: Vec3::new(1.0, 2.0, 3.0),
        });

        // Act
        let changed = apply_packet(&mut state, &packet);

        // Assert
        assert!(changed);
        assert_eq!(state.local_player.runtime_id, Some(42));
        assert_eq!(state.local_player.position, Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_entity_lifecycle_is_tracked() {
        // Arrange
        let mut state = GameState::default();
        let add = GamePacket::AddEntity(AddEntityPacket {
            runtime_id: 7,
            entity_type: "minecraft:pig".to_string(),
            position: Vec3::default(),
        });
        let moved = GamePacket::MovePlayer(MovePlayerPacket {
            runtime_id: 7,
            position: Vec3::new(5.0, 0.0, 0.0),
            pitch: 0.0,
            yaw: 0.0,
            on_ground: true,
        });
        let motion = GamePacket::SetEntityMotion(SetEntityMotionPacket {
            runtime_id: 7,
            motion: Vec3::new(0.0, 0.4, 0.0),
        });

        // Act
        apply_packet(&mut state, &add);
        apply_packet(&mut state, &moved);
        apply_packet(&mut state, &motion);

        // Assert
        let pig = state.entity(7).expect("entity must be tracked");
        assert_eq!(pig.position, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(pig.motion, Vec3::new(0.0, 0.4, 0.0));

        assert!(apply_packet(&mut state, &GamePacket::RemoveEntity { runtime_id: 7 }));
        assert!(state.entity(7).is_none());
    }

    #[test]
    fn test_unrelated_packet_changes_nothing() {
        let mut state = GameState::default();
        let packet = GamePacket::Unknown {
            id: 0x50,
            payload: vec![],
        };
        assert!(!apply_packet(&mut state, &packet));
    }

    #[test]
    fn test_tick_emitted_for_every_auth_input() {
        // Arrange
        let pipeline = tracked_pipeline();
        let ticks = record_events(&pipeline, EventKind::Tick);

        // Act
        pipeline.process(Direction::Outbound, auth_input(1, 0.0), &NullSink);
        pipeline.process(Direction::Outbound, auth_input(2, 0.0), &NullSink);

        // Assert
        assert_eq!(
            *ticks.lock().unwrap(),
            vec![Event::Tick { tick: 1 }, Event::Tick { tick: 2 }]
        );
    }

    #[test]
    fn test_render_only_when_state_changed() {
        // Arrange
        let pipeline = tracked_pipeline();
        let renders = record_events(&pipeline, EventKind::Render);

        // Act: first input moves the player, second repeats the position
        pipeline.process(Direction::Outbound, auth_input(1, 10.0), &NullSink);
        pipeline.process(Direction::Outbound, auth_input(2, 10.0), &NullSink);

        // Assert
        assert_eq!(renders.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_follow_up_request_triggers_next_render() {
        // Arrange: a listener that asks for one more render, once
        let pipeline = tracked_pipeline();
        let asked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&asked);
        let renders = Arc::new(Mutex::new(0_usize));
        let count = Arc::clone(&renders);
        pipeline.events().subscribe(
            EventKind::Render,
            listener_fn(move |_, follow_up| {
                *count.lock().unwrap() += 1;
                if !flag.swap(true, Ordering::SeqCst) {
                    follow_up.request();
                }
                Ok(())
            }),
        );

        // Act: position changes once, then stays still for two ticks
        pipeline.process(Direction::Outbound, auth_input(1, 3.0), &NullSink);
        pipeline.process(Direction::Outbound, auth_input(2, 3.0), &NullSink);
        pipeline.process(Direction::Outbound, auth_input(3, 3.0), &NullSink);

        // Assert: change render + one follow-up render
        assert_eq!(*renders.lock().unwrap(), 2);
    }

    #[test]
    fn test_tracker_never_intercepts() {
        let pipeline = tracked_pipeline();
        let packet = auth_input(1, 1.0);

        let verdict = pipeline.process(Direction::Outbound, packet.clone(), &NullSink);

        assert_eq!(verdict, mitm_core::Verdict::Forward(packet));
    }

    #[test]
    fn test_state_visible_to_downstream_handler() {
        // Arrange
        let pipeline = tracked_pipeline();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        pipeline.registry().register(
            "reader",
            Direction::Inbound,
            mitm_core::intercept::handler_fn(move |_, ctx| {
                *slot.lock().unwrap() = ctx.state.read().local_player.runtime_id;
                Ok(())
            }),
        );

        // Act
        pipeline.process(
            Direction::Inbound,
            GamePacket::StartGame(StartGamePacket {
                runtime_id: 99,
                position: Vec3::default(),
            }),
            &NullSink,
        );

        // Assert
        assert_eq!(*seen.lock().unwrap(), Some(99));
    }
}
