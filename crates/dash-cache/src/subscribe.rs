//! Per-key subscription bus with prefix fanout.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::key::CanonicalKey;

/// Callback invoked when a key's entry changes (data arrival, invalidation,
/// staleness transition). Listeners read current state through the store;
/// the bus carries no payload.
pub type Listener = Arc<dyn Fn(&CanonicalKey) + Send + Sync>;

/// Per-key sets of listener callbacks.
///
/// Notification is synchronous and in registration order. A panicking
/// listener is contained so it cannot block the rest of the set.
#[derive(Clone, Default)]
pub struct SubscriptionBus {
    inner: Arc<Mutex<HashMap<CanonicalKey, Vec<(u64, Listener)>>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `key`. Keep the returned handle and call
    /// [`SubscriptionHandle::unsubscribe`] to deregister.
    pub fn subscribe(
        &self,
        key: &CanonicalKey,
        listener: impl Fn(&CanonicalKey) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        SubscriptionHandle {
            bus: self.clone(),
            key: key.clone(),
            id,
        }
    }

    /// Invoke every listener registered for `key`, in registration order.
    pub fn notify(&self, key: &CanonicalKey) {
        let listeners: Vec<Listener> = match self.lock().get(key) {
            Some(entries) => entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        // Callbacks run outside the lock so they may re-enter the bus.
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(key))).is_err() {
                tracing::warn!(key = %key, "subscriber panicked during notify");
            }
        }
    }

    /// Invoke listeners of every key whose segments start with `prefix`.
    pub fn notify_prefix(&self, prefix: &CanonicalKey) {
        let matched: Vec<CanonicalKey> = self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in matched {
            self.notify(&key);
        }
    }

    /// Number of active listeners for `key`.
    pub fn subscriber_count(&self, key: &CanonicalKey) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// Keys that currently have at least one listener.
    pub fn subscribed_keys(&self) -> Vec<CanonicalKey> {
        self.lock().keys().cloned().collect()
    }

    fn unsubscribe(&self, key: &CanonicalKey, id: u64) {
        let mut map = self.lock();
        if let Some(entries) = map.get_mut(key) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                map.remove(key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CanonicalKey, Vec<(u64, Listener)>>> {
        self.inner.lock().expect("subscription bus lock poisoned")
    }
}

impl std::fmt::Debug for SubscriptionBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionBus")
            .field("keys", &self.lock().len())
            .finish()
    }
}

/// Handle for one registered listener.
#[derive(Debug)]
pub struct SubscriptionHandle {
    bus: SubscriptionBus,
    key: CanonicalKey,
    id: u64,
}

impl SubscriptionHandle {
    /// The key this subscription listens on.
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// Remove the listener from the bus.
    pub fn unsubscribe(self) {
        self.bus.unsubscribe(&self.key, self.id);
    }
}
