use thiserror::Error;

use crate::{AggregateId, MessageId, Version};

/// Errors that can occur when interacting with the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored aggregate version did not match the version the unit of
    /// work loaded. The whole change set was rejected.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// A row violates the outbox/inbox invariants.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// An update targeted a row that does not exist.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// The backend is unreachable or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for message store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
