//! Fetch-side infrastructure for the dashboard data layer.
//!
//! This crate provides:
//! - `FetchError` - Error taxonomy with retry classification
//! - `RetryConfig` / `execute` - Bounded exponential backoff with jitter
//! - `InFlightRegistry` - Single-flight deduplication of concurrent fetches
//!
//! Fetchers themselves (blockchain-client calls, content-store reads) are
//! opaque async callables supplied by the caller; nothing in this crate
//! knows what is being fetched.

mod error;
mod inflight;
mod retry;

pub use error::*;
pub use inflight::*;
pub use retry::*;
