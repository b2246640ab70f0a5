//! Cache error types.

use thiserror::Error;

/// Errors raised by cache stores and the cache-aside wrapper.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed or is unreachable.
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
