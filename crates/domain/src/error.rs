//! Domain error types.

use common::AggregateId;
use message_store::StoreError;
use thiserror::Error;

/// Errors that can occur on the write path.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The store rejected or failed the change set.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An outbox message could not be staged.
    #[error("Invalid outbox message: {0}")]
    InvalidMessage(String),

    /// A stored row belongs to a different aggregate type than requested.
    #[error("Aggregate {aggregate_id} is a {actual}, expected {expected}")]
    AggregateTypeMismatch {
        aggregate_id: AggregateId,
        expected: &'static str,
        actual: String,
    },

    /// An in-process subscriber failed.
    #[error("Subscriber error: {0}")]
    Subscriber(String),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
