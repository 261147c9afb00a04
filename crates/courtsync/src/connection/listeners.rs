//! Connection state listener registry.
//!
//! UI layers register a callback and receive every state transition in
//! registration order. Registration hands back a [`ListenerGuard`]; dropping
//! the guard (or calling [`ListenerGuard::dispose`]) removes the callback, so
//! a screen that goes away cannot leak its listener. A panicking callback is
//! caught and logged without disturbing the listeners after it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, trace};

use crate::models::ConnectionState;

/// Callback invoked on every connection state transition.
pub type ConnectionStateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: Vec<(u64, Arc<ConnectionStateCallback>)>,
}

/// Ordered registry of connection state listeners.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback and returns the guard that owns the registration.
    pub fn add(&self, callback: ConnectionStateCallback) -> ListenerGuard {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(callback)));
        trace!(listener_id = id, "registered connection state listener");
        ListenerGuard {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes every registered callback with `state`, in registration order.
    ///
    /// The registry lock is not held during the calls, so a callback may
    /// register or dispose listeners. A panic in one callback is logged and
    /// the remaining callbacks still run.
    pub fn notify(&self, state: ConnectionState) {
        let listeners: Vec<(u64, Arc<ConnectionStateCallback>)> =
            self.inner.lock().unwrap().listeners.clone();
        for (id, callback) in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(state)));
            if result.is_err() {
                error!(listener_id = id, state = %state, "connection state listener panicked");
            }
        }
    }

    /// Removes every listener. Outstanding guards become no-ops.
    pub fn clear(&self) {
        self.inner.lock().unwrap().listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns one listener registration; removes it when dropped.
#[must_use = "dropping the guard removes the listener"]
pub struct ListenerGuard {
    id: u64,
    registry: Weak<Mutex<RegistryInner>>,
}

impl ListenerGuard {
    /// Removes the listener now instead of at drop time.
    pub fn dispose(self) {
        drop(self);
    }

    fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap();
            inner.listeners.retain(|(id, _)| *id != self.id);
            trace!(listener_id = self.id, "removed connection state listener");
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn notifies_in_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            registry.add(Box::new(move |_| seen.lock().unwrap().push("first")))
        };
        let second = {
            let seen = seen.clone();
            registry.add(Box::new(move |_| seen.lock().unwrap().push("second")))
        };

        registry.notify(ConnectionState::Connected);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        drop(first);
        drop(second);
    }

    #[test]
    fn dropping_the_guard_removes_the_listener() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let guard = {
            let calls = calls.clone();
            registry.add(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };
        registry.notify(ConnectionState::Connecting);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(guard);
        registry.notify(ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_removes_the_listener() {
        let registry = ListenerRegistry::new();
        let guard = registry.add(Box::new(|_| {}));
        assert_eq!(registry.len(), 1);
        guard.dispose();
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let registry = ListenerRegistry::new();
        let reached = Arc::new(AtomicUsize::new(0));

        let panicking = registry.add(Box::new(|_| panic!("listener bug")));
        let counting = {
            let reached = reached.clone();
            registry.add(Box::new(move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
            }))
        };

        registry.notify(ConnectionState::Error);
        registry.notify(ConnectionState::Connected);
        assert_eq!(reached.load(Ordering::SeqCst), 2);

        drop(panicking);
        drop(counting);
    }

    #[test]
    fn clear_removes_everything_and_guards_stay_harmless() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let guard = {
            let calls = calls.clone();
            registry.add(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        };

        registry.clear();
        registry.notify(ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Guard drop after clear must not panic or remove someone else's slot.
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_can_dispose_another_during_notify() {
        let registry = ListenerRegistry::new();
        let second_calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<ListenerGuard>>> = Arc::new(Mutex::new(None));
        let disposer = {
            let slot = slot.clone();
            registry.add(Box::new(move |_| {
                if let Some(guard) = slot.lock().unwrap().take() {
                    guard.dispose();
                }
            }))
        };
        let second = {
            let second_calls = second_calls.clone();
            registry.add(Box::new(move |_| {
                second_calls.fetch_add(1, Ordering::SeqCst);
            }))
        };
        *slot.lock().unwrap() = Some(second);

        // First notify: the disposer removes the second listener, but the
        // snapshot taken for this round still includes it.
        registry.notify(ConnectionState::Connected);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        // Second notify: the second listener is gone.
        registry.notify(ConnectionState::Reconnecting);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        drop(disposer);
    }
}
