//! Invalidation event bus.
//!
//! The cache emits a [`CacheEvent`] for every mutating action. Listeners
//! registered with [`EventBus::subscribe()`] are called synchronously, in
//! subscription order, on the emitting thread. A panicking listener is
//! caught and logged; the emitter and the remaining listeners are not
//! affected. Events are not stored, so a late subscriber never sees
//! earlier events.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use crate::cache::CacheKey;
use crate::error::HuginnError;
use crate::monitor::{CorrelationMonitor, ErrorContext};

/// A change to the cache contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A value was written by a caller.
    Set { key: CacheKey },
    /// A background revalidation replaced a stale value.
    Updated { key: CacheKey },
    /// A single entry was removed on request.
    Invalidated { key: CacheKey },
    /// All entries of one owner were removed.
    OwnerInvalidated { owner_id: String, count: usize },
    /// All entries of one kind were removed.
    KindInvalidated { kind: String, count: usize },
    /// An entry was dropped to make room.
    Evicted { key: CacheKey },
    /// An entry aged past its stale window and was dropped on read.
    Expired { key: CacheKey },
    /// The cache was emptied.
    Cleared { count: usize },
}

impl CacheEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            CacheEvent::Set { .. } => EventType::Set,
            CacheEvent::Updated { .. } => EventType::Updated,
            CacheEvent::Invalidated { .. }
            | CacheEvent::OwnerInvalidated { .. }
            | CacheEvent::KindInvalidated { .. } => EventType::Invalidated,
            CacheEvent::Evicted { .. } => EventType::Evicted,
            CacheEvent::Expired { .. } => EventType::Expired,
            CacheEvent::Cleared { .. } => EventType::Cleared,
        }
    }
}

/// Filter used when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Receive every event.
    All,
    Set,
    Updated,
    Invalidated,
    Evicted,
    Expired,
    Cleared,
}

impl EventType {
    fn accepts(self, event: &CacheEvent) -> bool {
        self == EventType::All || self == event.event_type()
    }
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

struct Slot {
    id: u64,
    filter: EventType,
    listener: Listener,
}

type Slots = Mutex<Vec<Slot>>;

/// Typed synchronous pub/sub channel for [`CacheEvent`]s.
///
/// Cheap to clone; clones share the same listener list.
#[derive(Clone, Default)]
pub struct EventBus {
    slots: Arc<Slots>,
    next_id: Arc<AtomicU64>,
    monitor: Option<Arc<CorrelationMonitor>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route listener panics to `monitor` in addition to logging them.
    pub fn with_monitor(mut self, monitor: Arc<CorrelationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Register `listener` for events matching `filter`.
    ///
    /// The listener stays registered until [`Subscription::unsubscribe()`]
    /// is called; dropping the handle does not detach it.
    pub fn subscribe<F>(&self, filter: EventType, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push(Slot {
            id,
            filter,
            listener: Arc::new(listener),
        });
        Subscription {
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Deliver `event` to every matching listener.
    ///
    /// Returns the number of listeners that completed without panicking.
    /// The listener list is snapshotted first, so listeners may subscribe
    /// or unsubscribe from inside a callback.
    pub fn emit(&self, event: CacheEvent) -> usize {
        let targets: Vec<Listener> = self
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.filter.accepts(&event))
            .map(|slot| Arc::clone(&slot.listener))
            .collect();

        let mut delivered = 0;
        for listener in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(event = ?event.event_type(), panic = %message, "cache event listener panicked");
                    if let Some(monitor) = &self.monitor {
                        monitor.track_error(
                            &HuginnError::Panicked(message),
                            &ErrorContext::new()
                                .component("event_bus")
                                .operation("emit"),
                        );
                    }
                }
            }
        }
        delivered
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe()`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    slots: Weak<Slots>,
}

impl Subscription {
    /// Detach the listener. Returns false if the bus is gone or the
    /// listener was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != self.id);
        slots.len() != before
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
