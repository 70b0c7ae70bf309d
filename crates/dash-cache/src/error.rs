//! Cache operation errors.

/// Errors from key construction and cache bookkeeping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A key segment could not be serialized to JSON.
    #[error("key segment not serializable: {0}")]
    KeySegment(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::KeySegment(err.to_string())
    }
}
