//! Cache-side infrastructure for the dashboard data layer.
//!
//! This crate provides:
//! - `QueryKey` / `CanonicalKey` - Structured query keys with deterministic
//!   canonicalization
//! - `CacheStore` - Per-key data/error/staleness state with TTL eviction
//! - `SubscriptionBus` - Per-key listener sets with prefix fanout
//!
//! The store holds `serde_json::Value`s; typed (de)serialization happens at
//! the facade layer, keeping one untyped representation in the cache.

mod error;
mod key;
mod store;
mod subscribe;

pub use error::*;
pub use key::*;
pub use store::*;
pub use subscribe::*;
