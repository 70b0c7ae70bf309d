//! Single-flight deduplication of concurrent fetches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::FetchError;

/// The shared handle every deduplicated caller awaits.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Tracks at most one outstanding fetch per key.
///
/// The first caller for a key installs a shared future and drives the work;
/// every concurrent caller before settlement receives a clone of the same
/// handle, so the underlying fetch runs exactly once. The entry is removed
/// when the fetch settles, success or failure, so the next caller after
/// settlement starts fresh. Settled results are never served from here; that
/// is the cache store's job.
#[derive(Clone)]
pub struct InFlightRegistry<T> {
    inner: Arc<Mutex<HashMap<String, SharedFetch<T>>>>,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> InFlightRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the pending fetch for `key`, if one is outstanding.
    pub fn get(&self, key: &str) -> Option<SharedFetch<T>> {
        self.inner.lock().expect("in-flight lock poisoned").get(key).cloned()
    }

    /// Whether a fetch for `key` is outstanding.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().expect("in-flight lock poisoned").contains_key(key)
    }

    /// Number of outstanding fetches.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("in-flight lock poisoned").len()
    }

    /// Whether no fetches are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the pending fetch for `key`, starting one via `make` if none
    /// is outstanding.
    ///
    /// `make` is only invoked when this call installs a new entry; callers
    /// that lose the race share the winner's future. The registry entry is
    /// removed exactly once, just before the shared future settles.
    pub fn dedupe<F, Fut>(&self, key: &str, make: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut map = self.inner.lock().expect("in-flight lock poisoned");
        if let Some(pending) = map.get(key) {
            tracing::trace!(key, "joining in-flight fetch");
            return pending.clone();
        }

        let registry = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let fut = make();
        let shared = async move {
            let result = fut.await;
            registry
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&owned_key);
            result
        }
        .boxed()
        .shared();

        tracing::trace!(key, "starting fetch");
        map.insert(key.to_string(), shared.clone());
        shared
    }
}

impl<T> std::fmt::Debug for InFlightRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("len", &self.inner.lock().map(|m| m.len()).unwrap_or(0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let registry = InFlightRegistry::<u64>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let make = |registry: &InFlightRegistry<u64>| {
            let counter = Arc::clone(&calls);
            registry.dedupe("balance:0xabc", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(100)
            })
        };

        let a = make(&registry);
        let b = make(&registry);
        let c = make(&registry);

        let (ra, rb, rc) = tokio::join!(a, b, c);
        assert_eq!(ra, Ok(100));
        assert_eq!(rb, Ok(100));
        assert_eq!(rc, Ok(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_success() {
        let registry = InFlightRegistry::<u64>::new();
        let pending = registry.dedupe("k", || async { Ok(1) });
        assert!(registry.contains("k"));

        pending.await.unwrap();
        assert!(!registry.contains("k"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_entry_removed_after_failure() {
        let registry = InFlightRegistry::<u64>::new();
        let pending = registry.dedupe("k", || async {
            Err(FetchError::Timeout("rpc".into()))
        });

        assert!(pending.await.is_err());
        assert!(!registry.contains("k"));
    }

    #[tokio::test]
    async fn test_fresh_fetch_after_settlement() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            registry
                .dedupe("k", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let registry = InFlightRegistry::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));

        let a = {
            let counter = Arc::clone(&calls);
            registry.dedupe("a", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
        };
        let b = {
            let counter = Arc::clone(&calls);
            registry.dedupe("b", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
        };
        assert_eq!(registry.len(), 2);

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!((ra, rb), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
