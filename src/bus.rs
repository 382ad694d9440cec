//! Revalidate event bus.
//!
//! The application root owns one bus and dispatches `revalidate` when the
//! window regains focus, becomes visible, or comes back online. Stores and
//! trackers register a callback while mounted; the guard deregisters it on
//! drop. This replaces reaching into components through mutable globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

use crate::future::lock;

/// Callback invoked on every revalidate dispatch.
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

pub struct RefreshBus {
    weak: Weak<Self>,
    listeners: Mutex<HashMap<Uuid, RefreshCallback>>,
}

impl RefreshBus {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Register a callback for revalidate dispatches.
    pub fn register(&self, callback: RefreshCallback) -> RefreshGuard {
        let id = Uuid::new_v4();
        lock(&self.listeners).insert(id, callback);
        RefreshGuard { bus: self.weak.clone(), id }
    }

    /// Dispatch a revalidate to every registered listener.
    pub fn revalidate(&self) {
        let callbacks: Vec<RefreshCallback> = lock(&self.listeners).values().cloned().collect();
        debug!(listeners = callbacks.len(), "dispatching revalidate");
        for callback in callbacks {
            callback();
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn deregister(&self, id: Uuid) {
        lock(&self.listeners).remove(&id);
    }
}

/// Keeps one listener registered; dropping it deregisters.
pub struct RefreshGuard {
    bus: Weak<RefreshBus>,
    id: Uuid,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.deregister(self.id);
        }
    }
}
