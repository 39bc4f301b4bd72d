//! Synchronous, typed event bus.
//!
//! Modules use the bus for notifications that are not tied to a single packet:
//! a game tick passed, a module was switched on or off, the overlay should
//! redraw, the session ended.
//!
//! # Delivery rules
//!
//! - `emit` calls every listener subscribed to the event's kind, in
//!   subscription order, on the caller's thread.
//! - A listener that returns `Err` or panics is logged and counted; the
//!   remaining listeners still run.
//! - Listeners get the event by shared reference and cannot change it.  For
//!   kinds that allow it ([`EventKind::allows_follow_up`]) a listener may ask
//!   for a follow-up; the bus records the request in the returned
//!   [`Delivery`] and leaves acting on it to the emitter.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::intercept::handler::HandlerError;

// ── Event types ───────────────────────────────────────────────────────────────

/// A notification published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The client finished a game tick.
    Tick { tick: u64 },
    /// A handler registration was enabled or disabled.
    ModuleToggled { name: String, enabled: bool },
    /// Tracked state changed; overlays should redraw.
    Render,
    /// The session ended.
    Disconnected { reason: String },
}

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    ModuleToggled,
    Render,
    Disconnected,
}

impl EventKind {
    /// Whether listeners may request a follow-up for this kind.
    pub fn allows_follow_up(self) -> bool {
        matches!(self, EventKind::Render)
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Tick { .. } => EventKind::Tick,
            Event::ModuleToggled { .. } => EventKind::ModuleToggled,
            Event::Render => EventKind::Render,
            Event::Disconnected { .. } => EventKind::Disconnected,
        }
    }
}

/// Lets a listener ask the emitter for another round.
pub struct FollowUp {
    allowed: bool,
    requested: Cell<bool>,
}

impl FollowUp {
    fn new(allowed: bool) -> Self {
        Self {
            allowed,
            requested: Cell::new(false),
        }
    }

    /// Records a follow-up request.  Returns `false` (and records nothing)
    /// when the event kind does not allow follow-ups.
    pub fn request(&self) -> bool {
        if self.allowed {
            self.requested.set(true);
        }
        self.allowed
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Result of one `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Listeners that ran to completion.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
    /// At least one listener requested a follow-up.
    pub follow_up: bool,
}

// ── Listeners ─────────────────────────────────────────────────────────────────

/// Something that reacts to events.
///
/// Implemented for every `Fn(&Event, &FollowUp) -> Result<(), HandlerError>`
/// closure, which is what most modules pass in.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event, follow_up: &FollowUp) -> Result<(), HandlerError>;
}

impl<F> EventListener for F
where
    F: Fn(&Event, &FollowUp) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_event(&self, event: &Event, follow_up: &FollowUp) -> Result<(), HandlerError> {
        self(event, follow_up)
    }
}

/// Pins a closure to the listener signature so its argument types and
/// lifetimes are inferred without annotations.
pub fn listener_fn<F>(f: F) -> F
where
    F: Fn(&Event, &FollowUp) -> Result<(), HandlerError> + Send + Sync,
{
    f
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    kind: EventKind,
    listener: Arc<dyn EventListener>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Per-session event bus.  Cloning is cheap and clones share listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `listener` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl EventListener + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kind,
                listener: Arc::new(listener),
            });
        id
    }

    /// Removes a listener.  Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Delivers `event` to every listener of its kind.
    ///
    /// The listener list is snapshotted first, so a listener may subscribe or
    /// unsubscribe from inside its callback; the change applies from the next
    /// `emit`.
    pub fn emit(&self, event: &Event) -> Delivery {
        let kind = event.kind();
        let listeners: Vec<Arc<dyn EventListener>> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.listener))
            .collect();

        let follow_up = FollowUp::new(kind.allows_follow_up());
        let mut delivery = Delivery::default();

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event, &follow_up)))
                .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));
            match outcome {
                Ok(()) => delivery.delivered += 1,
                Err(err @ HandlerError::Panicked(_)) => {
                    error!("event listener for {kind:?} panicked: {err}");
                    delivery.failed += 1;
                }
                Err(err) => {
                    warn!("event listener for {kind:?} failed: {err}");
                    delivery.failed += 1;
                }
            }
        }

        delivery.follow_up = follow_up.requested.get();
        delivery
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .subscriptions
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
