//! Facade-level errors.

use dash_cache::CacheError;
use dash_fetch::FetchError;

/// Errors surfaced by [`crate::QueryClient`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The underlying fetch or mutate failed (after retry exhaustion).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Key construction failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Cached data did not deserialize into the requested type.
    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// No fetcher has been registered for the key (refetch before query).
    #[error("no fetcher registered for key {0}")]
    UnknownKey(String),
}

impl QueryError {
    /// The fetch error inside, if this is a fetch failure.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(err) => Some(err),
            _ => None,
        }
    }
}
