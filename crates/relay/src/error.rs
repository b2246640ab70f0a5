//! Relay error types.

use message_store::StoreError;
use thiserror::Error;

/// A failed publish attempt reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BrokerError(pub String);

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A failure raised by an inbox handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("malformed payload: {e}"))
    }
}

/// Errors raised by the relay workers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Fetching or writing back a batch failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// No handler is registered for the event type.
    #[error("No handler registered for event type {0}")]
    Dispatch(String),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
