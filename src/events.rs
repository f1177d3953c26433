//! # Typed Listener Registries
//!
//! Services expose their event surfaces as [`Listeners<T>`] instances:
//! subscribing returns a [`ListenerId`], unsubscribing takes it back, and
//! dispatch walks the listeners in registration order.
//!
//! Dispatch snapshots the callback list and invokes outside the lock, so a
//! callback may freely subscribe or unsubscribe (itself included) without
//! deadlocking. A listener removed mid-dispatch can still observe the event
//! currently being delivered, but never a later one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`Listeners::add`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A registry of callbacks for one event type.
pub struct Listeners<T> {
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Listeners<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Callbacks are invoked in registration order.
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered callback.
    ///
    /// Returns `true` if the id was present. Removing an unknown or
    /// already-removed id is a no-op.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Deliver an event to every registered callback.
    ///
    /// With no listeners registered this is a silent no-op.
    pub fn emit(&self, event: &T) {
        // Snapshot under the lock, invoke outside it.
        let snapshot: Vec<Callback<T>> = {
            let entries = self.entries.lock();
            entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_listeners_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        listeners.add(move |v| first.lock().push(("first", *v)));
        let second = Arc::clone(&seen);
        listeners.add(move |v| second.lock().push(("second", *v)));

        listeners.emit(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_removed_listener_stops_receiving() {
        let listeners: Listeners<()> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let id = listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        assert!(listeners.remove(id));
        listeners.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Second removal of the same id is a no-op.
        assert!(!listeners.remove(id));
    }

    #[test]
    fn test_emit_with_no_listeners_is_noop() {
        let listeners: Listeners<String> = Listeners::new();
        listeners.emit(&"nobody home".to_string());
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_unsubscribe_during_dispatch_does_not_deadlock() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let registry = Arc::clone(&listeners);
        let counter = Arc::clone(&hits);
        let self_id = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&self_id);
        let id = listeners.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot.lock().take() {
                registry.remove(id);
            }
        });
        *self_id.lock() = Some(id);

        listeners.emit(&());
        listeners.emit(&());

        // First emit delivered and self-removed; second found nobody.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }
}
