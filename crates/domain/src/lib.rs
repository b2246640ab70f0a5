//! Domain-side write path of the event-propagation engine.
//!
//! This crate provides:
//! - [`AggregateRoot`] and its per-aggregate [`EventLog`]
//! - [`UnitOfWork`], the transactional boundary that persists aggregate state
//!   and outbox rows together, then dispatches events in-process
//! - [`OutboxWriter`] for staging integration messages inside a unit of work
//! - [`EventDispatcher`], a startup-built table of in-process subscribers

pub mod aggregate;
pub mod dispatcher;
pub mod error;
pub mod outbox;
pub mod repository;
pub mod unit_of_work;

pub use aggregate::{AggregateRoot, DomainEvent, EventLog, PendingEvent, TrackedAggregate};
pub use dispatcher::{DispatchFailure, DispatchReport, EventDispatcher, EventSubscriber};
pub use error::{DomainError, Result};
pub use outbox::{IntegrationEvent, OutboxWriter, TOMBSTONE_EVENT_TYPE, stable_payload};
pub use repository::load_aggregate;
pub use unit_of_work::{CommitReport, UnitOfWork, UnitOfWorkFactory};
