//! Cache store with TTL eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dash_fetch::FetchError;
use serde_json::Value;
use tokio::time::Instant;

use crate::key::CanonicalKey;

/// Eviction TTL for entries created without one: a failed first fetch or an
/// optimistic write on a missing key. Matches the default `cache_time`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Callback invoked after an entry is removed by eviction or deletion.
pub type EvictHook = Arc<dyn Fn(&CanonicalKey) + Send + Sync>;

/// Read-only view of one cache entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// Latest successfully fetched (or optimistically written) data.
    pub data: Option<Value>,
    /// Latest fetch error, present only after a failed fetch.
    pub error: Option<FetchError>,
    /// When `data` was last confirmed by a successful fetch or commit.
    pub last_updated_at: Option<Instant>,
    /// Whether the entry has been invalidated or provisionally written.
    pub is_stale: bool,
}

impl EntrySnapshot {
    /// Whether the entry is fresh for the given staleness window.
    pub fn is_fresh(&self, stale_time: Duration) -> bool {
        if self.is_stale {
            return false;
        }
        match self.last_updated_at {
            Some(at) => Instant::now().duration_since(at) < stale_time,
            None => false,
        }
    }
}

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

struct CacheEntry {
    data: Option<Value>,
    error: Option<FetchError>,
    last_updated_at: Option<Instant>,
    is_stale: bool,
    /// Generation stamp matched by the eviction task before deleting, so a
    /// task that fires late cannot remove a newer entry.
    generation: u64,
    evict_task: Option<tokio::task::JoinHandle<()>>,
}

impl CacheEntry {
    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            data: self.data.clone(),
            error: self.error.clone(),
            last_updated_at: self.last_updated_at,
            is_stale: self.is_stale,
        }
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        if let Some(task) = self.evict_task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

/// Per-key cache of fetch results with hard TTL eviction.
///
/// All mutation happens in synchronous critical sections behind one lock;
/// the lock is never held across an await. Eviction is a spawned task per
/// entry, aborted whenever the entry is rewritten or deleted. When the task
/// fires the entry is deleted outright, which is distinct from merely being
/// marked stale.
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<HashMap<CanonicalKey, CacheEntry>>>,
    counters: Arc<Counters>,
    generation: Arc<AtomicU64>,
    evict_hook: Arc<Mutex<Option<EvictHook>>>,
}

impl CacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the entry for `key`, if present. No side effects beyond
    /// hit/miss accounting.
    pub fn get(&self, key: &CanonicalKey) -> Option<EntrySnapshot> {
        let map = self.lock();
        let snapshot = map.get(key).map(CacheEntry::snapshot);
        match &snapshot {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        snapshot
    }

    /// Write fetched data for `key`.
    ///
    /// Clears any error, stamps `last_updated_at`, clears staleness, and
    /// re-arms the eviction timer for `ttl` from now.
    pub fn set(&self, key: &CanonicalKey, data: Value, ttl: Duration) {
        let generation = self.next_generation();
        {
            let mut map = self.lock();
            self.counters.sets.fetch_add(1, Ordering::Relaxed);
            map.insert(
                key.clone(),
                CacheEntry {
                    data: Some(data),
                    error: None,
                    last_updated_at: Some(Instant::now()),
                    is_stale: false,
                    generation,
                    evict_task: None,
                },
            );
        }
        self.arm_eviction(key, ttl, generation);
        tracing::debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
    }

    /// Record a failed fetch for `key`.
    ///
    /// Prior data, if any, is preserved as a stale cached value for
    /// stale-while-revalidate reads; only the error and staleness change.
    pub fn set_error(&self, key: &CanonicalKey, error: FetchError) {
        let created = {
            let mut map = self.lock();
            match map.get_mut(key) {
                Some(entry) => {
                    entry.error = Some(error);
                    entry.is_stale = true;
                    None
                }
                None => {
                    let generation = self.next_generation();
                    map.insert(
                        key.clone(),
                        CacheEntry {
                            data: None,
                            error: Some(error),
                            last_updated_at: None,
                            is_stale: true,
                            generation,
                            evict_task: None,
                        },
                    );
                    Some(generation)
                }
            }
        };
        // A freshly created error entry still gets a finite lifetime.
        if let Some(generation) = created {
            self.arm_eviction(key, DEFAULT_TTL, generation);
        }
        tracing::debug!(key = %key, "cache error recorded");
    }

    /// Mark the entry for `key` stale without deleting its data.
    pub fn mark_stale(&self, key: &CanonicalKey) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.is_stale = true;
        }
    }

    /// Mark every entry whose key starts with `prefix` stale.
    ///
    /// Returns the affected keys so the caller can fan out notifications or
    /// background refetches.
    pub fn mark_stale_prefix(&self, prefix: &CanonicalKey) -> Vec<CanonicalKey> {
        let mut map = self.lock();
        let mut marked = Vec::new();
        for (key, entry) in map.iter_mut() {
            if key.starts_with(prefix) {
                entry.is_stale = true;
                marked.push(key.clone());
            }
        }
        marked
    }

    /// Write provisional (optimistic) data for `key`.
    ///
    /// The entry is marked stale and `last_updated_at` is left untouched; a
    /// later [`CacheStore::confirm`] makes it fresh, a rollback restores the
    /// previous data via [`CacheStore::restore`].
    pub fn put_provisional(&self, key: &CanonicalKey, data: Value) {
        let created = {
            let mut map = self.lock();
            match map.get_mut(key) {
                Some(entry) => {
                    entry.data = Some(data);
                    entry.error = None;
                    entry.is_stale = true;
                    None
                }
                None => {
                    let generation = self.next_generation();
                    map.insert(
                        key.clone(),
                        CacheEntry {
                            data: Some(data),
                            error: None,
                            last_updated_at: None,
                            is_stale: true,
                            generation,
                            evict_task: None,
                        },
                    );
                    Some(generation)
                }
            }
        };
        if let Some(generation) = created {
            self.arm_eviction(key, DEFAULT_TTL, generation);
        }
    }

    /// Confirm provisional data: clear staleness and stamp `last_updated_at`.
    pub fn confirm(&self, key: &CanonicalKey) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.is_stale = false;
            entry.last_updated_at = Some(Instant::now());
        }
    }

    /// Restore `data` for `key` (rollback of a provisional write). The entry
    /// stays stale: the remote state is unknown until the next fetch.
    pub fn restore(&self, key: &CanonicalKey, data: Option<Value>) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.data = data;
            entry.is_stale = true;
        }
    }

    /// Remove the entry for `key` and cancel its eviction timer.
    pub fn delete(&self, key: &CanonicalKey) {
        // CacheEntry::drop aborts the timer.
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.run_evict_hook(key);
        }
    }

    /// Drop all entries and cancel all eviction timers.
    pub fn clear(&self) {
        self.lock().clear();
        tracing::debug!("cache cleared");
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Register a callback run after an entry is evicted or deleted, so
    /// per-key state held elsewhere (registered fetchers) can be released.
    pub fn set_evict_hook(&self, hook: impl Fn(&CanonicalKey) + Send + Sync + 'static) {
        *self.evict_hook.lock().expect("evict hook lock poisoned") = Some(Arc::new(hook));
    }

    fn run_evict_hook(&self, key: &CanonicalKey) {
        let hook = self
            .evict_hook
            .lock()
            .expect("evict hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CanonicalKey, CacheEntry>> {
        self.inner.lock().expect("cache store lock poisoned")
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Arm the eviction timer for an entry inserted under `generation`.
    ///
    /// Armed after the insert so a zero TTL cannot fire against a
    /// not-yet-visible entry; if the entry was already replaced, the fresh
    /// task is aborted instead of attached.
    fn arm_eviction(&self, key: &CanonicalKey, ttl: Duration, generation: u64) {
        let evict_task = self.spawn_eviction(key.clone(), ttl, generation);
        let mut map = self.lock();
        match map.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.evict_task = Some(evict_task);
            }
            _ => evict_task.abort(),
        }
    }

    fn spawn_eviction(
        &self,
        key: CanonicalKey,
        ttl: Duration,
        generation: u64,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let evicted = {
                let mut map = store.lock();
                if map.get(&key).is_some_and(|e| e.generation == generation) {
                    // Take the entry without running abort on our own task.
                    if let Some(mut entry) = map.remove(&key) {
                        entry.evict_task = None;
                    }
                    store.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            };
            if evicted {
                tracing::debug!(key = %key, "cache entry evicted");
                // Outside the map lock: the hook may re-enter the store.
                store.run_evict_hook(&key);
            }
        })
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query_key;

    const TTL: Duration = Duration::from_millis(300_000);

    #[tokio::test]
    async fn test_set_then_get() {
        let store = CacheStore::new();
        let key = query_key!["balance", "0xabc"].canonicalize();

        store.set(&key, json!(100), TTL);
        let snap = store.get(&key).unwrap();

        assert_eq!(snap.data, Some(json!(100)));
        assert!(snap.error.is_none());
        assert!(!snap.is_stale);
        assert!(snap.last_updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_window() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();
        let stale_time = Duration::from_millis(30_000);

        store.set(&key, json!(1), TTL);
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert!(store.get(&key).unwrap().is_fresh(stale_time));

        tokio::time::sleep(Duration::from_millis(21_000)).await;
        assert!(!store.get(&key).unwrap().is_fresh(stale_time));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_deletes_entry() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(1), TTL);
        tokio::time::sleep(Duration::from_millis(300_001)).await;

        assert!(store.get(&key).is_none());
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rearms_eviction() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(1), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.set(&key, json!(2), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(60)).await;

        // 120ms after the first set, but only 60ms after the second.
        let snap = store.get(&key).unwrap();
        assert_eq!(snap.data, Some(json!(2)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_set_error_preserves_data() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(5), TTL);
        store.set_error(&key, FetchError::Timeout("rpc".into()));

        let snap = store.get(&key).unwrap();
        assert_eq!(snap.data, Some(json!(5)));
        assert_eq!(snap.error, Some(FetchError::Timeout("rpc".into())));
        assert!(snap.is_stale);
    }

    #[tokio::test]
    async fn test_set_clears_error() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set_error(&key, FetchError::Timeout("rpc".into()));
        store.set(&key, json!(6), TTL);

        let snap = store.get(&key).unwrap();
        assert_eq!(snap.data, Some(json!(6)));
        assert!(snap.error.is_none());
        assert!(!snap.is_stale);
    }

    #[tokio::test]
    async fn test_error_without_prior_data() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set_error(&key, FetchError::Connection("reset".into()));

        let snap = store.get(&key).unwrap();
        assert!(snap.data.is_none());
        assert!(snap.error.is_some());
        assert!(snap.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_only_entry_is_evicted() {
        let store = CacheStore::new();
        let key = query_key!["flaky"].canonicalize();

        store.set_error(&key, FetchError::Timeout("rpc".into()));
        assert!(store.get(&key).is_some());

        tokio::time::sleep(DEFAULT_TTL + Duration::from_millis(1)).await;
        assert!(store.get(&key).is_none());
        assert_eq!(store.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_existing_entry_keeps_its_timer() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(1), Duration::from_millis(100));
        store.set_error(&key, FetchError::Timeout("rpc".into()));

        tokio::time::sleep(Duration::from_millis(101)).await;
        assert!(store.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisional_entry_on_missing_key_is_evicted() {
        let store = CacheStore::new();
        let key = query_key!["missing"].canonicalize();

        store.put_provisional(&key, json!(1));
        assert!(store.get(&key).is_some());

        tokio::time::sleep(DEFAULT_TTL + Duration::from_millis(1)).await;
        assert!(store.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_hook_fires_on_eviction_and_delete() {
        let store = CacheStore::new();
        let evicted = Arc::new(Mutex::new(Vec::new()));
        {
            let evicted = Arc::clone(&evicted);
            store.set_evict_hook(move |key| {
                evicted.lock().unwrap().push(key.as_str().to_string());
            });
        }
        let a = query_key!["a"].canonicalize();
        let b = query_key!["b"].canonicalize();

        store.set(&a, json!(1), Duration::from_millis(100));
        store.set(&b, json!(2), TTL);
        store.delete(&b);
        tokio::time::sleep(Duration::from_millis(101)).await;

        assert_eq!(
            *evicted.lock().unwrap(),
            vec![r#"["b"]"#.to_string(), r#"["a"]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_mark_stale_keeps_data() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(1), TTL);
        store.mark_stale(&key);

        let snap = store.get(&key).unwrap();
        assert!(snap.is_stale);
        assert_eq!(snap.data, Some(json!(1)));
        assert!(!snap.is_fresh(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_mark_stale_prefix_is_segment_wise() {
        let store = CacheStore::new();
        let a = query_key!["dao", "A"].canonicalize();
        let a_props = query_key!["dao", "A", "proposals"].canonicalize();
        let ab = query_key!["dao", "AB"].canonicalize();
        let b = query_key!["dao", "B"].canonicalize();
        for key in [&a, &a_props, &ab, &b] {
            store.set(key, json!(0), TTL);
        }

        let marked = store.mark_stale_prefix(&query_key!["dao", "A"].canonicalize());

        assert_eq!(marked.len(), 2);
        assert!(store.get(&a).unwrap().is_stale);
        assert!(store.get(&a_props).unwrap().is_stale);
        assert!(!store.get(&ab).unwrap().is_stale);
        assert!(!store.get(&b).unwrap().is_stale);
    }

    #[tokio::test]
    async fn test_provisional_confirm_and_restore() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        store.set(&key, json!(5), TTL);
        store.put_provisional(&key, json!(6));
        let snap = store.get(&key).unwrap();
        assert_eq!(snap.data, Some(json!(6)));
        assert!(snap.is_stale);

        store.confirm(&key);
        let snap = store.get(&key).unwrap();
        assert!(!snap.is_stale);
        assert_eq!(snap.data, Some(json!(6)));

        store.restore(&key, Some(json!(5)));
        let snap = store.get(&key).unwrap();
        assert_eq!(snap.data, Some(json!(5)));
        assert!(snap.is_stale);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = CacheStore::new();
        let a = query_key!["a"].canonicalize();
        let b = query_key!["b"].canonicalize();

        store.set(&a, json!(1), TTL);
        store.set(&b, json!(2), TTL);

        store.delete(&a);
        assert!(store.get(&a).is_none());
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stats_accounting() {
        let store = CacheStore::new();
        let key = query_key!["k"].canonicalize();

        assert!(store.get(&key).is_none());
        store.set(&key, json!(1), TTL);
        store.get(&key);

        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
    }
}
