//! Optimistic updates with one-shot commit/rollback.

use dash_cache::{CacheStore, CanonicalKey, QueryKey, SubscriptionBus};
use serde_json::Value;

use crate::client::QueryClient;

/// A speculative cache write awaiting confirmation.
///
/// Created by [`QueryClient::optimistic`]: the new value is visible to
/// subscribers immediately, before the remote operation settles. Exactly one
/// of [`OptimisticUpdate::commit`] or [`OptimisticUpdate::rollback`] should
/// be invoked; nothing in the type system forces this, so dropping the
/// handle unresolved logs a warning and leaves the entry stale until the
/// next fetch.
#[must_use = "call commit() or rollback() to resolve the optimistic update"]
pub struct OptimisticUpdate {
    store: CacheStore,
    bus: SubscriptionBus,
    key: CanonicalKey,
    previous: Option<Value>,
    resolved: bool,
}

impl OptimisticUpdate {
    pub(crate) fn apply(
        store: CacheStore,
        bus: SubscriptionBus,
        key: CanonicalKey,
        update: impl FnOnce(Option<&Value>) -> Value,
    ) -> Self {
        let previous = store.get(&key).and_then(|snap| snap.data);
        let next = update(previous.as_ref());
        store.put_provisional(&key, next);
        bus.notify(&key);
        Self {
            store,
            bus,
            key,
            previous,
            resolved: false,
        }
    }

    /// The key this update targets.
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// The snapshot that a rollback would restore.
    pub fn previous_data(&self) -> Option<&Value> {
        self.previous.as_ref()
    }

    /// Keep the speculative value: clear staleness and stamp the entry as
    /// freshly updated.
    pub fn commit(mut self) {
        self.resolved = true;
        self.store.confirm(&self.key);
        self.bus.notify(&self.key);
    }

    /// Restore the captured snapshot and re-notify subscribers. The entry
    /// stays stale; the next fetch reconciles with the remote state.
    pub fn rollback(mut self) {
        self.resolved = true;
        self.store.restore(&self.key, self.previous.take());
        self.bus.notify(&self.key);
    }
}

impl Drop for OptimisticUpdate {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(
                key = %self.key,
                "optimistic update dropped without commit or rollback"
            );
        }
    }
}

impl std::fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticUpdate")
            .field("key", &self.key)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl QueryClient {
    /// Apply a speculative update to the cached data for `key`.
    ///
    /// Reads the current cached value, writes `update(old)` immediately, and
    /// returns the one-shot handle. The caller must invoke `rollback` in its
    /// failure handler; failure is not auto-detected.
    pub fn optimistic(
        &self,
        key: &QueryKey,
        update: impl FnOnce(Option<&Value>) -> Value,
    ) -> OptimisticUpdate {
        OptimisticUpdate::apply(
            self.store().clone(),
            self.bus().clone(),
            key.canonicalize(),
            update,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use dash_cache::query_key;
    use serde_json::json;

    use super::*;
    use crate::options::QueryOptions;

    async fn seeded_client(key: &QueryKey, value: Value) -> QueryClient {
        let client = QueryClient::new();
        let seed = value.clone();
        client
            .query::<Value, _, _>(
                key,
                move || {
                    let seed = seed.clone();
                    async move { Ok(seed) }
                },
                QueryOptions::new(),
            )
            .await;
        client
    }

    #[tokio::test]
    async fn test_rollback_restores_and_notifies_twice() {
        let key = query_key!["count"];
        let client = seeded_client(&key, json!(5)).await;
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let _sub = client.subscribe(&key, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let update = client.optimistic(&key, |old| {
            json!(old.and_then(Value::as_u64).unwrap_or(0) + 1)
        });
        assert_eq!(client.entry_snapshot(&key).unwrap().data, Some(json!(6)));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        update.rollback();
        assert_eq!(client.entry_snapshot(&key).unwrap().data, Some(json!(5)));
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_commit_marks_entry_fresh() {
        let key = query_key!["count"];
        let client = seeded_client(&key, json!(5)).await;

        let update = client.optimistic(&key, |_| json!(6));
        assert!(client.entry_snapshot(&key).unwrap().is_stale);

        update.commit();
        let snap = client.entry_snapshot(&key).unwrap();
        assert_eq!(snap.data, Some(json!(6)));
        assert!(!snap.is_stale);
        assert!(snap.last_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_optimistic_write_is_visible_before_settlement() {
        let key = query_key!["count"];
        let client = seeded_client(&key, json!(1)).await;

        let update = client.optimistic(&key, |_| json!(2));
        // Observers see the speculative value immediately.
        assert_eq!(client.entry_snapshot(&key).unwrap().data, Some(json!(2)));
        update.commit();
    }

    #[tokio::test]
    async fn test_apply_on_empty_entry() {
        let client = QueryClient::new();
        let key = query_key!["missing"];

        let update = client.optimistic(&key, |old| {
            assert!(old.is_none());
            json!(1)
        });
        assert_eq!(client.entry_snapshot(&key).unwrap().data, Some(json!(1)));

        update.rollback();
        assert_eq!(client.entry_snapshot(&key).unwrap().data, None);
    }

    #[tokio::test]
    async fn test_unresolved_drop_leaves_other_entries_intact() {
        let key = query_key!["a"];
        let other = query_key!["b"];
        let client = seeded_client(&key, json!(1)).await;
        client
            .query::<Value, _, _>(&other, || async { Ok(json!(2)) }, QueryOptions::new())
            .await;

        {
            let _update = client.optimistic(&key, |_| json!(10));
            // Dropped unresolved: warns, entry stays stale.
        }

        assert!(client.entry_snapshot(&key).unwrap().is_stale);
        let untouched = client.entry_snapshot(&other).unwrap();
        assert_eq!(untouched.data, Some(json!(2)));
        assert!(!untouched.is_stale);
    }
}
