//! Query client for the governance dashboard data layer.
//!
//! Every asynchronous read or write the dashboard performs against the
//! blockchain node or the off-chain content store goes through the
//! [`QueryClient`] here. The client composes the lower layers:
//!
//! - request deduplication (one in-flight fetch per canonical key)
//! - a freshness-gated cache with hard TTL eviction
//! - bounded retries with exponential backoff and jitter
//! - per-key subscriptions with prefix invalidation
//! - optimistic updates with one-shot commit/rollback
//! - pagination cursors over page-parameterized fetchers
//!
//! Fetchers and mutators are opaque async callables returning
//! `Result<serde_json::Value, FetchError>`; the client never knows what
//! SDK sits behind them.
//!
//! # Example
//!
//! ```rust,ignore
//! use dash_query::prelude::*;
//!
//! let client = QueryClient::new();
//! let response: QueryResponse<u64> = client
//!     .query(
//!         &query_key!["balance", "0xabc"],
//!         || async { Ok(serde_json::json!(100)) },
//!         QueryOptions::new().with_stale_time(Duration::from_secs(30)),
//!     )
//!     .await;
//! ```

mod client;
mod error;
mod mutation;
mod optimistic;
mod options;
mod pagination;

pub use client::*;
pub use error::*;
pub use mutation::*;
pub use optimistic::*;
pub use options::*;
pub use pagination::*;

// Re-export the building blocks callers touch directly.
pub use dash_cache::{
    query_key, CacheStats, CanonicalKey, EntrySnapshot, QueryKey, SubscriptionHandle,
};
pub use dash_fetch::{FetchError, RetryConfig};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        query_key, FetchError, Mutation, MutationOptions, OptimisticUpdate, PaginatedQuery,
        QueryClient, QueryKey, QueryOptions, QueryResponse, RetryConfig,
    };
}
