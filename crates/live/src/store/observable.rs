//! Shared subscribe/notify/snapshot primitive.
//!
//! Every store keeps its mutable state private and publishes an immutable
//! snapshot through one of these cells. A snapshot is replaced as a whole;
//! listeners fire exactly once per replacement that actually changed it, so
//! consumers keying on equality never re-run for a no-op poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Hooks tying background activity to subscriber count: the first subscriber
/// starts it, the last unsubscribe halts it.
pub(crate) struct Lifecycle {
    pub on_first_subscriber: Box<dyn Fn() + Send + Sync>,
    pub on_zero_subscribers: Box<dyn Fn() + Send + Sync>,
}

pub struct ObservableStore<S> {
    shared: Arc<Shared<S>>,
}

struct Shared<S> {
    state: Mutex<S>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// Subscription guard; dropping it unsubscribes. Holds no strong reference
/// to the store, so a forgotten guard never keeps a store alive.
pub struct Subscription {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Explicit form of dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl<S> ObservableStore<S> {
    pub fn new(initial: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(initial),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.shared.lifecycle.lock() = Some(lifecycle);
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> S
    where
        S: Clone,
    {
        self.shared.state.lock().clone()
    }

    /// Install `next` and notify listeners, unless it equals the current
    /// snapshot. Returns whether anything changed.
    pub fn replace(&self, next: S) -> bool
    where
        S: PartialEq,
    {
        let changed = {
            let mut state = self.shared.state.lock();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Clone the current snapshot, apply `patch`, and install the result if
    /// it differs. The patch runs under the state lock; listeners fire after
    /// it is released.
    pub fn mutate(&self, patch: impl FnOnce(&mut S)) -> bool
    where
        S: Clone + PartialEq,
    {
        let changed = {
            let mut state = self.shared.state.lock();
            let mut next = state.clone();
            patch(&mut next);
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Register a change listener. The listener is invoked after every
    /// snapshot replacement that changed state, with no locks held.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription
    where
        S: Send + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut listeners = self.shared.listeners.lock();
            listeners.insert(id, Arc::new(listener));
            listeners.len()
        };
        if count == 1
            && let Some(lifecycle) = &*self.shared.lifecycle.lock()
        {
            (lifecycle.on_first_subscriber)();
        }

        let shared: Weak<Shared<S>> = Arc::downgrade(&self.shared);
        Subscription {
            on_drop: Some(Box::new(move || {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let now_empty = {
                    let mut listeners = shared.listeners.lock();
                    listeners.remove(&id);
                    listeners.is_empty()
                };
                if now_empty
                    && let Some(lifecycle) = &*shared.lifecycle.lock()
                {
                    (lifecycle.on_zero_subscribers)();
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }

    fn notify(&self) {
        let listeners: Vec<Listener> = self.shared.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }
}

impl<S> Clone for ObservableStore<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Default> Default for ObservableStore<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}
