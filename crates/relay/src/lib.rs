//! Background relay workers.
//!
//! This crate provides:
//! - [`OutboxPublisher`], which moves committed outbox rows to a
//!   [`MessageBroker`] with retry and poison handling
//! - [`InboxProcessor`], which applies received inbox rows through a
//!   [`HandlerRegistry`] with exponential backoff
//! - [`LoopbackBroker`], which delivers into an inbox of the same store
//! - [`InMemoryBroker`] for tests

pub mod backoff;
pub mod broker;
pub mod error;
pub mod handler;
pub mod loopback;
pub mod processor;
pub mod publisher;

pub use backoff::RetryPolicy;
pub use broker::{InMemoryBroker, MessageBroker};
pub use error::{BrokerError, HandlerError, RelayError, Result};
pub use handler::{HandlerRegistry, InboxHandler};
pub use loopback::LoopbackBroker;
pub use processor::{InboxProcessor, ProcessReport, ProcessorConfig};
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig};

pub use tokio_util::sync::CancellationToken;
