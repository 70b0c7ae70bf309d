//! The owned query-client service.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use dash_cache::{
    CacheStats, CacheStore, CanonicalKey, EntrySnapshot, QueryKey, SubscriptionBus,
    SubscriptionHandle,
};
use dash_fetch::{execute as retry_execute, FetchError, InFlightRegistry, SharedFetch};
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::QueryError;
use crate::options::QueryOptions;

/// Boxed future returned by a fetcher.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// An opaque fetch callable (blockchain read, content-store read).
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

#[derive(Clone)]
struct Registered {
    fetcher: Fetcher,
    options: QueryOptions,
}

/// Settled result of a query, deserialized at the typed boundary.
#[derive(Debug, Clone)]
pub struct QueryResponse<T> {
    /// Fetched data, or stale cached data when the fetch failed.
    pub data: Option<T>,
    /// The failure, when the fetch (or deserialization) failed.
    pub error: Option<QueryError>,
    /// Whether `data` is stale (served alongside an error, or invalidated).
    pub is_stale: bool,
}

/// Untyped settled result; `data` is the shared cached value.
#[derive(Debug, Clone)]
pub struct RawQueryResponse {
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub is_stale: bool,
}

impl RawQueryResponse {
    fn typed<T: DeserializeOwned>(self) -> QueryResponse<T> {
        let RawQueryResponse {
            data,
            error,
            is_stale,
        } = self;
        match data {
            Some(value) => match serde_json::from_value::<T>((*value).clone()) {
                Ok(typed) => QueryResponse {
                    data: Some(typed),
                    error,
                    is_stale,
                },
                Err(err) => QueryResponse {
                    data: None,
                    error: Some(QueryError::Deserialize(err.to_string())),
                    is_stale,
                },
            },
            None => QueryResponse {
                data: None,
                error,
                is_stale,
            },
        }
    }
}

/// Live view of a key's state, for UI bindings and diagnostics.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    /// A fetch is outstanding and there is no cached data to show yet.
    pub is_loading: bool,
    /// A fetch is outstanding (possibly a background revalidation).
    pub is_fetching: bool,
    pub is_stale: bool,
}

/// Owned cache/dedup/subscription service for dashboard queries.
///
/// One client instance is shared (cheaply cloned) across the app and
/// injected into callers; there is no ambient global. All state mutation
/// happens in synchronous critical sections, so interleaved callers can
/// never observe a partially written entry.
#[derive(Clone)]
pub struct QueryClient {
    store: CacheStore,
    bus: SubscriptionBus,
    inflight: InFlightRegistry<Arc<Value>>,
    registered: Arc<Mutex<HashMap<CanonicalKey, Registered>>>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Create an empty client.
    pub fn new() -> Self {
        let store = CacheStore::new();
        let registered: Arc<Mutex<HashMap<CanonicalKey, Registered>>> = Arc::default();

        // Evicted or deleted entries release their fetcher registration, so
        // the registry cannot outgrow the cache.
        let registrations = Arc::clone(&registered);
        store.set_evict_hook(move |key| {
            registrations
                .lock()
                .expect("registry lock poisoned")
                .remove(key);
        });

        Self {
            store,
            bus: SubscriptionBus::new(),
            inflight: InFlightRegistry::new(),
            registered,
        }
    }

    /// Run a query: serve fresh cache, join an in-flight fetch, or fetch.
    ///
    /// Control flow per key: an outstanding fetch is joined first (single
    /// flight); otherwise a fresh cache entry is returned with no fetcher
    /// invocation; otherwise the fetcher runs under the retry policy, the
    /// result lands in the cache, the eviction timer is re-armed, and
    /// subscribers are notified.
    pub async fn query<T, F, Fut>(
        &self,
        key: &QueryKey,
        fetch: F,
        options: QueryOptions,
    ) -> QueryResponse<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || fetch().boxed());
        self.query_raw(key, fetcher, options).await.typed()
    }

    /// Untyped version of [`QueryClient::query`] taking a boxed fetcher.
    pub async fn query_raw(
        &self,
        key: &QueryKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> RawQueryResponse {
        let canonical = key.canonicalize();
        self.register(&canonical, Arc::clone(&fetcher), options.clone());

        if !options.enabled {
            return self.cached_response(&canonical);
        }

        // In-flight first: concurrent callers share one fetch.
        if let Some(pending) = self.inflight.get(canonical.as_str()) {
            let result = pending.await;
            return self.settled_response(&canonical, result, &options);
        }

        // Fresh cache entry: no network access.
        if let Some(snapshot) = self.store.get(&canonical) {
            if snapshot.is_fresh(options.stale_time) {
                tracing::trace!(key = %canonical, "serving fresh cache entry");
                return RawQueryResponse {
                    data: snapshot.data.map(Arc::new),
                    error: None,
                    is_stale: false,
                };
            }
        }

        let pending = self.start_fetch(&canonical);
        let result = pending.await;
        self.settled_response(&canonical, result, &options)
    }

    /// Force a fetch for a previously queried key, still deduplicated.
    pub async fn refetch(&self, key: &QueryKey) -> Result<Arc<Value>, QueryError> {
        let canonical = key.canonicalize();
        if !self.has_fetcher(&canonical) {
            return Err(QueryError::UnknownKey(canonical.as_str().to_string()));
        }
        self.start_fetch(&canonical).await.map_err(QueryError::from)
    }

    /// Mark every entry under `prefix` stale and notify its subscribers.
    ///
    /// Keys with at least one active subscriber and a registered fetcher are
    /// refetched in the background; failures land in entry error state like
    /// any other fetch.
    pub fn invalidate(&self, prefix: &QueryKey) {
        let canonical_prefix = prefix.canonicalize();
        let marked = self.store.mark_stale_prefix(&canonical_prefix);
        tracing::debug!(prefix = %canonical_prefix, count = marked.len(), "invalidated");

        for key in marked {
            self.bus.notify(&key);
            if self.bus.subscriber_count(&key) > 0 && self.has_fetcher(&key) {
                let pending = self.start_fetch(&key);
                tokio::spawn(async move {
                    let _ = pending.await;
                });
            }
        }
    }

    /// Drop all entries, cancel all eviction timers, and release every
    /// fetcher registration.
    pub fn clear(&self) {
        self.store.clear();
        self.registered
            .lock()
            .expect("registry lock poisoned")
            .clear();
    }

    /// Read-only snapshot of one entry, for diagnostics and tests.
    pub fn entry_snapshot(&self, key: &QueryKey) -> Option<EntrySnapshot> {
        self.store.get(&key.canonicalize())
    }

    /// Live state for a key, including in-flight flags.
    pub fn state(&self, key: &QueryKey) -> QueryState {
        let canonical = key.canonicalize();
        let snapshot = self.store.get(&canonical);
        let is_fetching = self.inflight.contains(canonical.as_str());
        let (data, error, is_stale) = match snapshot {
            Some(snap) => (snap.data, snap.error, snap.is_stale),
            None => (None, None, false),
        };
        QueryState {
            is_loading: is_fetching && data.is_none(),
            is_fetching,
            data,
            error,
            is_stale,
        }
    }

    /// Register a listener for changes to `key`.
    pub fn subscribe(
        &self,
        key: &QueryKey,
        listener: impl Fn(&CanonicalKey) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.bus.subscribe(&key.canonicalize(), listener)
    }

    /// Cache hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub(crate) fn store(&self) -> &CacheStore {
        &self.store
    }

    pub(crate) fn bus(&self) -> &SubscriptionBus {
        &self.bus
    }

    fn register(&self, key: &CanonicalKey, fetcher: Fetcher, options: QueryOptions) {
        self.registered
            .lock()
            .expect("registry lock poisoned")
            .insert(key.clone(), Registered { fetcher, options });
    }

    fn has_fetcher(&self, key: &CanonicalKey) -> bool {
        self.registered
            .lock()
            .expect("registry lock poisoned")
            .contains_key(key)
    }

    /// Start (or join) the deduplicated fetch for `key`.
    ///
    /// The fetch runs under the registered retry policy; on settlement the
    /// result is written to the store, the eviction timer is re-armed, and
    /// subscribers are notified, before any caller observes the result.
    fn start_fetch(&self, key: &CanonicalKey) -> SharedFetch<Arc<Value>> {
        let registered = self
            .registered
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned();

        let store = self.store.clone();
        let bus = self.bus.clone();
        let owned_key = key.clone();

        self.inflight.dedupe(key.as_str(), move || async move {
            let Registered { fetcher, options } = match registered {
                Some(reg) => reg,
                // refetch/invalidate guard against this; dedupe callers
                // always register first.
                None => {
                    return Err(FetchError::Validation("no fetcher registered".into()));
                }
            };

            let result = retry_execute(&options.retry, || (fetcher)()).await;
            match result {
                Ok(value) => {
                    store.set(&owned_key, value.clone(), options.cache_time);
                    bus.notify(&owned_key);
                    Ok(Arc::new(value))
                }
                Err(err) => {
                    store.set_error(&owned_key, err.clone());
                    bus.notify(&owned_key);
                    Err(err)
                }
            }
        })
    }

    fn settled_response(
        &self,
        key: &CanonicalKey,
        result: Result<Arc<Value>, FetchError>,
        options: &QueryOptions,
    ) -> RawQueryResponse {
        match result {
            Ok(value) => {
                if let Some(hook) = &options.on_success {
                    hook(&value);
                }
                RawQueryResponse {
                    data: Some(value),
                    error: None,
                    is_stale: false,
                }
            }
            Err(err) => {
                if let Some(hook) = &options.on_error {
                    hook(&err);
                }
                // Stale-while-revalidate: surface prior data alongside the error.
                let stale_data = self
                    .store
                    .get(key)
                    .and_then(|snap| snap.data)
                    .map(Arc::new);
                RawQueryResponse {
                    data: stale_data,
                    error: Some(QueryError::Fetch(err)),
                    is_stale: true,
                }
            }
        }
    }

    fn cached_response(&self, key: &CanonicalKey) -> RawQueryResponse {
        match self.store.get(key) {
            Some(snap) => RawQueryResponse {
                is_stale: snap.is_stale,
                data: snap.data.map(Arc::new),
                error: snap.error.map(QueryError::Fetch),
            },
            None => RawQueryResponse {
                data: None,
                error: None,
                is_stale: false,
            },
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("store", &self.store)
            .field("inflight", &self.inflight)
            .finish()
    }
}
