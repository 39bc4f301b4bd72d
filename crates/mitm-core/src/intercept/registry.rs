//! Ordered handler registry and the chain that runs it.
//!
//! # How a pass works (for beginners)
//!
//! Every decoded packet is wrapped in an [`InterceptablePacket`] and handed
//! to [`HandlerRegistry::run_chain`].  The chain:
//!
//! 1. Takes a snapshot of the registrations (a `Vec` of `Arc`s).  The lock is
//!    released immediately, so handlers can register, unregister or toggle
//!    modules from inside their own callback without deadlocking.  Those
//!    changes are seen by the next packet, never by the current pass.
//! 2. Walks the snapshot in registration order.  A registration runs only if
//!    its direction matches, its enabled flag is set, and its optional
//!    condition accepts the packet *as it currently is* (after upstream
//!    replacements).
//! 3. Does not stop when a handler intercepts.  Later handlers still observe
//!    the packet, so state trackers never miss traffic.
//! 4. Catches handler failures, both `Err` returns and panics.  The failure is
//!    logged with the handler's name and the chain moves on with the packet
//!    exactly as the failed handler left it.  A condition that panics counts
//!    as a failure and its handler is skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::events::{Event, EventBus};
use crate::intercept::handler::{HandlerContext, HandlerError, PacketHandler};
use crate::intercept::interceptable::{Direction, InterceptablePacket};
use crate::protocol::packets::GamePacket;

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no handler registration with id {0:?}")]
    UnknownId(RegistrationId),

    #[error("no handler registered under the name {0:?}")]
    UnknownName(String),
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Stable handle for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

/// Per-packet activation predicate evaluated before the handler runs.
pub type Condition = dyn Fn(&GamePacket) -> bool + Send + Sync;

struct Registration {
    id: RegistrationId,
    name: String,
    direction: Direction,
    enabled: AtomicBool,
    condition: Option<Box<Condition>>,
    handler: Arc<dyn PacketHandler>,
}

impl Registration {
    fn is_enabled_for(&self, direction: Direction) -> bool {
        self.direction == direction && self.enabled.load(Ordering::Acquire)
    }

    /// Evaluates the condition.  A panicking condition counts as a refusal.
    fn accepts(&self, packet: &GamePacket) -> Result<bool, HandlerError> {
        match &self.condition {
            None => Ok(true),
            Some(accepts) => catch_unwind(AssertUnwindSafe(|| accepts(packet)))
                .map_err(HandlerError::from_panic),
        }
    }
}

/// Read-only view of a registration, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub id: RegistrationId,
    pub name: String,
    pub direction: Direction,
    pub enabled: bool,
}

/// Counters from one chain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// Handlers that were invoked (including those that failed).
    pub invoked: usize,
    /// Handlers that returned `Err` or panicked, plus conditions that panicked.
    pub failed: usize,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The ordered list of handlers for one relay session.
///
/// Cloning is cheap; clones share the same registrations.  When built with
/// [`HandlerRegistry::with_events`] every enable/disable transition is
/// published as [`Event::ModuleToggled`].
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    registrations: Arc<RwLock<Vec<Arc<Registration>>>>,
    next_id: Arc<AtomicU64>,
    events: Option<EventBus>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that announces toggles on `events`.
    pub fn with_events(events: EventBus) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Appends an enabled handler for `direction`.
    pub fn register(
        &self,
        name: impl Into<String>,
        direction: Direction,
        handler: impl PacketHandler + 'static,
    ) -> RegistrationId {
        self.insert(name.into(), direction, None, Arc::new(handler))
    }

    /// Like [`register`](Self::register), but the handler only runs for
    /// packets `condition` accepts.
    pub fn register_when(
        &self,
        name: impl Into<String>,
        direction: Direction,
        condition: impl Fn(&GamePacket) -> bool + Send + Sync + 'static,
        handler: impl PacketHandler + 'static,
    ) -> RegistrationId {
        self.insert(
            name.into(),
            direction,
            Some(Box::new(condition)),
            Arc::new(handler),
        )
    }

    /// Registers one handler instance for several directions.
    ///
    /// Each direction gets its own registration (and id) but they share the
    /// name, so [`set_enabled_by_name`](Self::set_enabled_by_name) toggles
    /// them together.
    pub fn register_shared(
        &self,
        name: impl Into<String>,
        directions: &[Direction],
        handler: Arc<dyn PacketHandler>,
    ) -> Vec<RegistrationId> {
        let name = name.into();
        directions
            .iter()
            .map(|&direction| self.insert(name.clone(), direction, None, Arc::clone(&handler)))
            .collect()
    }

    fn insert(
        &self,
        name: String,
        direction: Direction,
        condition: Option<Box<Condition>>,
        handler: Arc<dyn PacketHandler>,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("registered handler {name:?} ({direction}) as {id:?}");
        self.write().push(Arc::new(Registration {
            id,
            name,
            direction,
            enabled: AtomicBool::new(true),
            condition,
            handler,
        }));
        id
    }

    /// Removes a registration.  A pass already in progress still finishes with
    /// the snapshot it took.
    pub fn unregister(&self, id: RegistrationId) -> Result<(), RegistryError> {
        let mut regs = self.write();
        let index = regs
            .iter()
            .position(|r| r.id == id)
            .ok_or(RegistryError::UnknownId(id))?;
        let removed = regs.remove(index);
        debug!("unregistered handler {:?} ({:?})", removed.name, id);
        Ok(())
    }

    /// Enables or disables one registration.  Returns the previous state.
    pub fn set_enabled(&self, id: RegistrationId, enabled: bool) -> Result<bool, RegistryError> {
        let registration = self
            .read_snapshot()
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(RegistryError::UnknownId(id))?;
        let previous = registration.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            self.announce_toggle(&registration.name, enabled);
        }
        Ok(previous)
    }

    /// Enables or disables every registration called `name`.
    ///
    /// Returns how many registrations changed state.  One
    /// [`Event::ModuleToggled`] is published if anything changed.
    pub fn set_enabled_by_name(&self, name: &str, enabled: bool) -> Result<usize, RegistryError> {
        let matching: Vec<_> = self
            .read_snapshot()
            .into_iter()
            .filter(|r| r.name == name)
            .collect();
        if matching.is_empty() {
            return Err(RegistryError::UnknownName(name.to_string()));
        }
        let changed = matching
            .iter()
            .filter(|r| r.enabled.swap(enabled, Ordering::AcqRel) != enabled)
            .count();
        if changed > 0 {
            self.announce_toggle(name, enabled);
        }
        Ok(changed)
    }

    /// `Some(true)` if any registration called `name` is enabled.
    pub fn is_enabled_by_name(&self, name: &str) -> Option<bool> {
        let regs = self.read_snapshot();
        let mut matching = regs.iter().filter(|r| r.name == name).peekable();
        matching.peek()?;
        Some(matching.any(|r| r.enabled.load(Ordering::Acquire)))
    }

    /// Lists registrations in chain order.
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.read_snapshot()
            .iter()
            .map(|r| RegistrationInfo {
                id: r.id,
                name: r.name.clone(),
                direction: r.direction,
                enabled: r.enabled.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Chain execution ───────────────────────────────────────────────────────

    /// Runs every active handler for the packet's direction, in order.
    pub fn run_chain(&self, packet: &mut InterceptablePacket, ctx: &HandlerContext<'_>) -> ChainReport {
        let direction = packet.direction();
        let mut report = ChainReport::default();

        for registration in self.read_snapshot() {
            if !registration.is_enabled_for(direction) {
                continue;
            }
            match registration.accepts(packet.packet()) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    report.failed += 1;
                    error!(
                        "condition of handler {:?} panicked on {} ({direction}): {err}",
                        registration.name,
                        packet.packet().name()
                    );
                    continue;
                }
            }
            report.invoked += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                registration.handler.handle(packet, ctx)
            }))
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));

            match outcome {
                Ok(()) => {}
                Err(err @ HandlerError::Panicked(_)) => {
                    report.failed += 1;
                    error!(
                        "handler {:?} panicked on {} ({direction}): {err}",
                        registration.name,
                        packet.packet().name()
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "handler {:?} failed on {} ({direction}): {err}",
                        registration.name,
                        packet.packet().name()
                    );
                }
            }
        }

        report
    }

    /// Calls `on_disconnect` once per distinct handler instance.
    pub fn notify_disconnect(&self, reason: &str) {
        let mut seen: Vec<*const ()> = Vec::new();
        for registration in self.read_snapshot() {
            let key = Arc::as_ptr(&registration.handler) as *const ();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let name = &registration.name;
            if catch_unwind(AssertUnwindSafe(|| registration.handler.on_disconnect(reason))).is_err() {
                error!("handler {name:?} panicked in on_disconnect");
            }
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    fn read_snapshot(&self) -> Vec<Arc<Registration>> {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Registration>>> {
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn announce_toggle(&self, name: &str, enabled: bool) {
        debug!("handler {name:?} {}", if enabled { "enabled" } else { "disabled" });
        if let Some(events) = &self.events {
            events.emit(&Event::ModuleToggled {
                name: name.to_string(),
                enabled,
            });
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registrations", &self.registrations())
            .finish()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
