//! Fetch error taxonomy with retry classification.

/// Error type for fetch and mutate operations.
///
/// Variants are classified by retry policy rather than by concrete source:
/// the same taxonomy covers blockchain-node reads, signing requests, and
/// content-store fetches. All payloads are strings so settled errors can be
/// cloned and fanned out to every caller sharing a deduplicated fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The user declined the operation (e.g. rejected a signing prompt).
    #[error("declined: {0}")]
    Declined(String),

    /// Malformed or rejected input.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP-level failure with a status code.
    #[error("HTTP error: {status} {message}")]
    Http { status: u16, message: String },

    /// The request timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection-level failure (reset, refused, DNS).
    #[error("connection error: {0}")]
    Connection(String),

    /// Anything else: protocol or logic errors, not retried.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FetchError {
    /// Whether a retry attempt may succeed.
    ///
    /// Transient network failures (timeouts, connection errors, 5xx/429/408
    /// statuses) retry; user declines, validation failures, and protocol
    /// errors surface immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http { status, .. } => {
                (500..600).contains(status) || *status == 429 || *status == 408
            }
            Self::Declined(_) | Self::Validation(_) | Self::Protocol(_) => false,
        }
    }

    /// Short classification label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Declined(_) => "declined",
            Self::Validation(_) => "validation",
            Self::Http { .. } => "http",
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
        }
    }
}
