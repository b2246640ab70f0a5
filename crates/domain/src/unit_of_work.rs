//! The transactional boundary of the write path.

use std::sync::Arc;

use common::{AggregateId, SharedClock, SystemClock};
use message_store::{ChangeSet, TransactionalStore};
use serde::de::DeserializeOwned;

use crate::aggregate::{AggregateRoot, TrackedAggregate};
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::outbox::OutboxWriter;
use crate::repository::load_aggregate;

/// Summary of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub aggregates: usize,
    pub events_dispatched: usize,
    pub dispatch_failures: usize,
    pub outbox_messages: usize,
}

/// Collects aggregate mutations and outbox rows, then persists them in one
/// store transaction.
///
/// Dropping a unit without calling [`commit`](Self::commit) discards every
/// staged outbox row; tracked aggregates keep their pending events.
pub struct UnitOfWork<'a, S: TransactionalStore + ?Sized> {
    store: &'a S,
    dispatcher: &'a EventDispatcher,
    tracked: Vec<&'a mut dyn TrackedAggregate>,
    outbox: OutboxWriter,
}

impl<'a, S: TransactionalStore + ?Sized> UnitOfWork<'a, S> {
    pub fn new(store: &'a S, dispatcher: &'a EventDispatcher, clock: SharedClock) -> Self {
        Self {
            store,
            dispatcher,
            tracked: Vec::new(),
            outbox: OutboxWriter::new(clock),
        }
    }

    /// Registers an aggregate as dirty.
    ///
    /// Returns `false` without tracking when an aggregate with the same id is
    /// already part of this unit.
    pub fn track(&mut self, aggregate: &'a mut dyn TrackedAggregate) -> bool {
        let id = aggregate.tracked_id();
        if self.is_tracked(id) {
            tracing::debug!(aggregate_id = %id, "aggregate already tracked");
            return false;
        }
        self.tracked.push(aggregate);
        true
    }

    pub fn is_tracked(&self, aggregate_id: AggregateId) -> bool {
        self.tracked.iter().any(|a| a.tracked_id() == aggregate_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Outbox writer bound to this unit.
    pub fn outbox(&mut self) -> &mut OutboxWriter {
        &mut self.outbox
    }

    /// Persists every tracked aggregate and staged outbox row atomically, then
    /// dispatches the collected events in-process.
    ///
    /// Dispatch happens after the transaction committed, so subscriber
    /// failures are reported in the [`CommitReport`] and never undo the write.
    /// On a store error nothing is written and the tracked aggregates keep
    /// their events and versions.
    #[tracing::instrument(
        skip(self),
        fields(aggregates = self.tracked.len(), outbox = self.outbox.staged().len())
    )]
    pub async fn commit(mut self) -> Result<CommitReport> {
        let mut events = Vec::new();
        let mut changes = ChangeSet::new();
        for aggregate in &self.tracked {
            events.extend(aggregate.pending_events()?);
            changes.aggregates.push(aggregate.staged_state()?);
        }
        changes.outbox = self.outbox.take();

        let mut report = CommitReport {
            aggregates: changes.aggregates.len(),
            outbox_messages: changes.outbox.len(),
            ..CommitReport::default()
        };

        if !changes.is_empty() {
            if let Err(e) = self.store.persist(changes).await {
                tracing::error!(error = %e, "unit of work commit failed");
                return Err(e.into());
            }
        }

        for aggregate in self.tracked.iter_mut() {
            aggregate.mark_persisted();
        }
        metrics::counter!("uow_commits_total").increment(1);

        let dispatch = self.dispatcher.dispatch(&events).await;
        for failure in &dispatch.failures {
            tracing::warn!(
                event_id = %failure.event_id,
                event_type = failure.event_type,
                subscriber = failure.subscriber,
                error = %failure.error,
                "in-process dispatch failed after commit"
            );
        }
        metrics::counter!("uow_dispatch_failures_total").increment(dispatch.failures.len() as u64);

        for aggregate in self.tracked.iter_mut() {
            aggregate.clear_events();
        }

        report.events_dispatched = events.len();
        report.dispatch_failures = dispatch.failures.len();
        tracing::debug!(
            events = report.events_dispatched,
            dispatch_failures = report.dispatch_failures,
            "unit of work committed"
        );
        Ok(report)
    }
}

/// Hands out units of work bound to a shared store, dispatcher and clock.
pub struct UnitOfWorkFactory<S: TransactionalStore> {
    store: Arc<S>,
    dispatcher: Arc<EventDispatcher>,
    clock: SharedClock,
}

impl<S: TransactionalStore> Clone for UnitOfWorkFactory<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: TransactionalStore> UnitOfWorkFactory<S> {
    pub fn new(store: Arc<S>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self::with_clock(store, dispatcher, SystemClock::shared())
    }

    pub fn with_clock(store: Arc<S>, dispatcher: Arc<EventDispatcher>, clock: SharedClock) -> Self {
        Self {
            store,
            dispatcher,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn begin(&self) -> UnitOfWork<'_, S> {
        UnitOfWork::new(&self.store, &self.dispatcher, self.clock.clone())
    }

    /// Loads an aggregate through the factory's store.
    pub async fn load<A>(&self, id: AggregateId) -> Result<Option<A>>
    where
        A: AggregateRoot + DeserializeOwned,
    {
        load_aggregate(self.store.as_ref(), id).await
    }
}
