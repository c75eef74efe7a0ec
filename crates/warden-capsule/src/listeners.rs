//! Ordered stimulus listener registry.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, trace, warn};
use warden_core::Stimulus;

/// A stimulus listener.
pub type Listener = Arc<dyn Fn(&Stimulus) + Send + Sync>;

/// Listeners keyed by registration order.
///
/// Delivery is synchronous and in registration order. A panicking listener
/// is logged and skipped; later listeners still receive the stimulus.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, Listener>>,
}

impl RegistryInner {
    fn remove(&self, id: u64) -> bool {
        let removed = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(listener_id = id, "Stimulus listener removed");
        }
        removed
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It receives every stimulus delivered after this
    /// call returns.
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        debug!(listener_id = id, "Stimulus listener registered");
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a stimulus to every registered listener.
    ///
    /// The listener set is snapshotted first, so a listener may subscribe
    /// or unsubscribe from inside its callback.
    pub fn notify(&self, stimulus: &Stimulus) {
        self.notify_while(stimulus, || true);
    }

    /// Like [`notify`](Self::notify), but checks `open` before each
    /// listener and stops delivering as soon as it returns `false`.
    pub fn notify_while(&self, stimulus: &Stimulus, open: impl Fn() -> bool) {
        let snapshot: Vec<(u64, Listener)> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in snapshot {
            if !open() {
                trace!(sense = %stimulus.sense, "Delivery closed; skipping remaining listeners");
                return;
            }
            trace!(listener_id = id, sense = %stimulus.sense, "Notifying listener");
            let result = catch_unwind(AssertUnwindSafe(|| listener(stimulus)));
            if let Err(e) = result {
                warn!(
                    listener_id = id,
                    sense = %stimulus.sense,
                    error = ?e,
                    "Stimulus listener panicked"
                );
            }
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("All stimulus listeners cleared");
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listener_count", &self.len())
            .finish()
    }
}

/// Handle returned by a successful subscribe.
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
#[must_use = "dropping a Subscription leaves the listener registered with no way to remove it"]
pub struct Subscription {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    /// Registration id, unique within its registry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns `false` if it was already gone (for
    /// example, cleared by shutdown).
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}
