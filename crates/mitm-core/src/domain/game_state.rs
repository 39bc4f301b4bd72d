//! What the relay knows about the world, reconstructed from observed packets.
//!
//! The state tracker handler is the only writer; modules read it through the
//! [`SharedGameState`] handle in their `HandlerContext`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::protocol::packets::Vec3;

/// The player this client controls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPlayer {
    /// Assigned by `StartGame`; `None` before the world has loaded.
    pub runtime_id: Option<u64>,
    pub position: Option<Vec3>,
    /// Last tick number reported by `PlayerAuthInput`.
    pub last_tick: Option<u64>,
}

/// Another entity in view.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub runtime_id: u64,
    pub entity_type: String,
    pub position: Vec3,
    /// Last velocity applied by the server.
    pub motion: Vec3,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameState {
    pub local_player: LocalPlayer,
    entities: HashMap<u64, TrackedEntity>,
}

impl GameState {
    pub fn entity(&self, runtime_id: u64) -> Option<&TrackedEntity> {
        self.entities.get(&runtime_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    /// Inserts or replaces an entity.  Returns `true` if the table changed.
    pub fn upsert_entity(&mut self, entity: TrackedEntity) -> bool {
        match self.entities.get(&entity.runtime_id) {
            Some(existing) if *existing == entity => false,
            _ => {
                self.entities.insert(entity.runtime_id, entity);
                true
            }
        }
    }

    pub fn remove_entity(&mut self, runtime_id: u64) -> Option<TrackedEntity> {
        self.entities.remove(&runtime_id)
    }

    /// Moves a known entity.  Unknown ids are ignored.
    pub fn move_entity(&mut self, runtime_id: u64, position: Vec3) -> bool {
        match self.entities.get_mut(&runtime_id) {
            Some(entity) if entity.position != position => {
                entity.position = position;
                true
            }
            _ => false,
        }
    }

    pub fn set_entity_motion(&mut self, runtime_id: u64, motion: Vec3) -> bool {
        match self.entities.get_mut(&runtime_id) {
            Some(entity) if entity.motion != motion => {
                entity.motion = motion;
                true
            }
            _ => false,
        }
    }

    /// The closest tracked entity to the local player, if both are known.
    pub fn nearest_entity(&self) -> Option<&TrackedEntity> {
        let origin = self.local_player.position?;
        self.entities.values().min_by(|a, b| {
            a.position
                .distance(&origin)
                .total_cmp(&b.position.distance(&origin))
        })
    }

    /// Entities within `radius` of the local player.
    pub fn entities_within(&self, radius: f32) -> Vec<&TrackedEntity> {
        let Some(origin) = self.local_player.position else {
            return Vec::new();
        };
        self.entities
            .values()
            .filter(|e| e.position.distance(&origin) <= radius)
            .collect()
    }

    /// Forgets everything; used when the session ends.
    pub fn clear(&mut self) {
        *self = GameState::default();
    }
}

/// Shared handle to one session's [`GameState`].
///
/// Both pump tasks hold a clone.  Lock poisoning is ignored: a handler that
/// panics mid-update has already been reported by the chain, and the state it
/// left behind is still the best information available.
#[derive(Debug, Clone, Default)]
pub struct SharedGameState(Arc<RwLock<GameState>>);

impl SharedGameState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, GameState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, GameState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A point-in-time copy for callers that must not hold the lock.
    pub fn snapshot(&self) -> GameState {
        self.read().clone()
    }
}
