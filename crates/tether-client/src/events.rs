//! Typed event registry shared by module clients.
//!
//! Each module defines one concrete event enum and a parallel `Kind`
//! discriminant; handlers subscribe to a kind and receive the full event.
//! This replaces stringly-keyed listener maps: an emitted event and its
//! handlers agree on shape at compile time, and unknown event names cannot
//! exist.
//!
//! Delivery rules:
//! - Handlers for a kind fire in registration order.
//! - A handler that panics is caught and logged; it never suppresses
//!   delivery to the remaining handlers.
//! - An event with zero handlers is silently dropped.
//! - [`EventRegistry::off`] removes exactly the named handler; others for
//!   the same kind keep firing.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
};

/// An event type with a flat discriminant for subscription filtering.
pub trait Event: Send + Sync + 'static {
    /// Discriminant identifying which handlers an event reaches.
    type Kind: Copy + Eq + std::fmt::Debug + Send;

    /// The discriminant of this event value.
    fn kind(&self) -> Self::Kind;
}

/// Token returned by [`EventRegistry::on`]; pass to
/// [`EventRegistry::off`] to remove exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E: Event> {
    id: HandlerId,
    kind: E::Kind,
    handler: Handler<E>,
}

/// Handler table for one module's events.
///
/// Pure data structure; see [`SharedRegistry`] for the concurrency wrapper
/// module clients actually hold.
pub struct EventRegistry<E: Event> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

impl<E: Event> EventRegistry<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: 0, entries: Vec::new() }
    }

    /// Register a handler for one event kind.
    pub fn on(
        &mut self,
        kind: E::Kind,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, kind, handler: Arc::new(handler) });
        id
    }

    /// Remove exactly the handler named by `id`.
    ///
    /// Returns false if the handler was already removed (or never existed).
    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Drop every handler. Used by `destroy()`; safe to call repeatedly.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Handlers subscribed to `kind`, in registration order.
    ///
    /// Returns owned clones so the caller can invoke them without holding
    /// any lock over the registry.
    #[must_use]
    pub fn handlers_for(&self, kind: E::Kind) -> Vec<Handler<E>> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }

    /// Number of registered handlers across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E: Event> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe registry handle held by a module client and its router-side
/// message handler.
///
/// Handlers are invoked with no lock held, so a handler may freely call
/// back into its client — including `on`/`off` on this same registry —
/// without deadlocking. Subscriptions made during an emission take effect
/// for the next event, not the current one.
pub struct SharedRegistry<E: Event> {
    inner: Arc<Mutex<EventRegistry<E>>>,
}

impl<E: Event> Clone for SharedRegistry<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Event> SharedRegistry<E> {
    /// Create an empty shared registry.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(EventRegistry::new())) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventRegistry<E>> {
        // A poisoned registry only means a panic elsewhere while holding
        // the lock; the handler table itself stays consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for one event kind.
    pub fn on(&self, kind: E::Kind, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerId {
        self.lock().on(kind, handler)
    }

    /// Remove exactly the handler named by `id`.
    pub fn off(&self, id: HandlerId) -> bool {
        self.lock().off(id)
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registered handlers across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver an event to every handler subscribed to its kind.
    ///
    /// Panics inside a handler are caught and logged so they cannot cancel
    /// delivery to the remaining handlers or unwind into the dispatch loop.
    pub fn emit(&self, event: &E) {
        let handlers = self.lock().handlers_for(event.kind());

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(kind = ?event.kind(), "event handler panicked; continuing delivery");
            }
        }
    }
}

impl<E: Event> Default for SharedRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ping {
        High(u32),
        Low(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PingKind {
        High,
        Low,
    }

    impl Event for Ping {
        type Kind = PingKind;
        fn kind(&self) -> PingKind {
            match self {
                Self::High(_) => PingKind::High,
                Self::Low(_) => PingKind::Low,
            }
        }
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let registry = SharedRegistry::<Ping>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            registry.on(PingKind::High, move |_| log.lock().unwrap().push(tag));
        }

        registry.emit(&Ping::High(1));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn off_removes_exactly_one_handler() {
        let registry = SharedRegistry::<Ping>::new();
        let count = Arc::new(AtomicU32::new(0));

        let keep = Arc::clone(&count);
        registry.on(PingKind::High, move |_| {
            keep.fetch_add(1, Ordering::SeqCst);
        });

        let drop_count = Arc::clone(&count);
        let id = registry.on(PingKind::High, move |_| {
            drop_count.fetch_add(100, Ordering::SeqCst);
        });

        assert!(registry.off(id));
        assert!(!registry.off(id), "second removal is a no-op");

        registry.emit(&Ping::High(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kind_filtering() {
        let registry = SharedRegistry::<Ping>::new();
        let count = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&count);
        registry.on(PingKind::Low, move |event| {
            assert!(matches!(event, Ping::Low(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&Ping::High(1));
        registry.emit(&Ping::Low(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let registry = SharedRegistry::<Ping>::new();
        let count = Arc::new(AtomicU32::new(0));

        registry.on(PingKind::High, |_| panic!("boom"));
        let counter = Arc::clone(&count);
        registry.on(PingKind::High, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&Ping::High(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_during_emission() {
        let registry = SharedRegistry::<Ping>::new();
        let count = Arc::new(AtomicU32::new(0));

        let reg = registry.clone();
        let counter = Arc::clone(&count);
        registry.on(PingKind::High, move |_| {
            let inner_counter = Arc::clone(&counter);
            reg.on(PingKind::High, move |_| {
                inner_counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        // First emission registers; only the second emission increments.
        registry.emit(&Ping::High(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        registry.emit(&Ping::High(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let registry = SharedRegistry::<Ping>::new();
        registry.on(PingKind::High, |_| {});
        registry.clear();
        registry.clear();
        assert!(registry.is_empty());
        registry.emit(&Ping::High(1)); // no handlers: silently dropped
    }
}
