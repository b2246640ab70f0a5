//! Shared types for the outbox/inbox workspace.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use types::{AggregateId, EventId, MessageId};
