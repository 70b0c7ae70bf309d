//! Per-query configuration.

use std::sync::Arc;
use std::time::Duration;

use dash_fetch::{FetchError, RetryConfig};
use serde_json::Value;

pub(crate) type SuccessHook = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type ErrorHook = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Options for a single query.
///
/// `stale_time` gates whether a cached entry is served without a network
/// fetch; `cache_time` is the hard eviction TTL armed on every successful
/// fetch. Defaults: always-stale (`stale_time` zero), five-minute eviction,
/// three attempts with exponential backoff.
#[derive(Clone)]
pub struct QueryOptions {
    /// Window during which a cached entry is fresh.
    pub stale_time: Duration,
    /// Eviction TTL armed on each successful fetch.
    pub cache_time: Duration,
    /// Retry policy for the fetch.
    pub retry: RetryConfig,
    /// When false, the query reads the cache but never fetches.
    pub enabled: bool,
    pub(crate) on_success: Option<SuccessHook>,
    pub(crate) on_error: Option<ErrorHook>,
}

impl QueryOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the freshness window.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the eviction TTL.
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable fetching.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run a callback after each successful fetch settlement.
    pub fn on_success(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Run a callback after each failed fetch settlement.
    pub fn on_error(mut self, hook: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(300),
            retry: RetryConfig::default(),
            enabled: true,
            on_success: None,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .finish()
    }
}
