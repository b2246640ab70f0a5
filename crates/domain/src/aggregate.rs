//! Aggregate roots and their pending-event buffers.

use chrono::{DateTime, Utc};
use common::{AggregateId, EventId};
use message_store::{AggregateState, Version};
use serde::Serialize;

use crate::error::Result;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + Send + Sync + Clone {
    /// Returns the event type name, used as the in-process routing key.
    fn event_type(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct RecordedEvent<E> {
    event_id: EventId,
    occurred_at: DateTime<Utc>,
    event: E,
}

/// Ordered buffer of events an aggregate raised since its last commit.
///
/// Business methods append; only a successful unit-of-work commit clears it.
/// Aggregates keep the log out of their persisted state with `#[serde(skip)]`.
#[derive(Debug, Clone)]
pub struct EventLog<E> {
    pending: Vec<RecordedEvent<E>>,
}

impl<E> Default for EventLog<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<E: DomainEvent> EventLog<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event occurring now.
    pub fn record(&mut self, event: E) {
        self.record_at(event, Utc::now());
    }

    pub fn record_at(&mut self, event: E, occurred_at: DateTime<Utc>) {
        self.pending.push(RecordedEvent {
            event_id: EventId::new(),
            occurred_at,
            event,
        });
    }

    /// Pending events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &E> {
        self.pending.iter().map(|r| &r.event)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Serializes the pending events into dispatchable envelopes without
    /// draining the buffer.
    pub fn snapshot(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
    ) -> Result<Vec<PendingEvent>> {
        self.pending
            .iter()
            .map(|recorded| -> Result<PendingEvent> {
                Ok(PendingEvent {
                    event_id: recorded.event_id,
                    aggregate_id,
                    aggregate_type,
                    event_type: recorded.event.event_type(),
                    occurred_at: recorded.occurred_at,
                    payload: serde_json::to_value(&recorded.event)?,
                })
            })
            .collect()
    }
}

/// A domain event captured at commit time, ready for in-process dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: &'static str,
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Trait for aggregate roots whose state is persisted by a unit of work.
///
/// The serialized form of the aggregate is its stored state, so the event log
/// and the version must be excluded from serialization.
pub trait AggregateRoot: Serialize + Send + Sync {
    /// The type of events this aggregate raises.
    type Event: DomainEvent;

    /// Returns the aggregate type name.
    fn aggregate_type() -> &'static str;

    fn id(&self) -> AggregateId;

    /// Version loaded from storage; 0 for an aggregate never persisted.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn event_log(&self) -> &EventLog<Self::Event>;

    fn event_log_mut(&mut self) -> &mut EventLog<Self::Event>;
}

/// Object-safe view of an aggregate used by the unit of work.
///
/// Implemented for every [`AggregateRoot`]; there is no need to implement it
/// by hand.
pub trait TrackedAggregate: Send + Sync {
    fn tracked_id(&self) -> AggregateId;

    fn tracked_type(&self) -> &'static str;

    fn pending_events(&self) -> Result<Vec<PendingEvent>>;

    fn staged_state(&self) -> Result<AggregateState>;

    /// Advances the version after the state row was written.
    fn mark_persisted(&mut self);

    fn clear_events(&mut self);
}

impl<A: AggregateRoot> TrackedAggregate for A {
    fn tracked_id(&self) -> AggregateId {
        self.id()
    }

    fn tracked_type(&self) -> &'static str {
        A::aggregate_type()
    }

    fn pending_events(&self) -> Result<Vec<PendingEvent>> {
        self.event_log().snapshot(self.id(), A::aggregate_type())
    }

    fn staged_state(&self) -> Result<AggregateState> {
        Ok(AggregateState {
            aggregate_id: self.id(),
            aggregate_type: A::aggregate_type().to_string(),
            expected_version: self.version(),
            state: serde_json::to_value(self)?,
        })
    }

    fn mark_persisted(&mut self) {
        let next = self.version().next();
        self.set_version(next);
    }

    fn clear_events(&mut self) {
        self.event_log_mut().clear();
    }
}
