use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AggregateId, ChangeSet, Delivery, InboxRecord, MessageId, OutboxMessage, Result,
    StoredAggregate,
};

/// Write side used by a unit of work.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Applies a change set atomically.
    ///
    /// Aggregate rows are checked against their `expected_version`; a single
    /// mismatch fails the whole set with `ConcurrencyConflict` and nothing,
    /// outbox rows included, is written.
    async fn persist(&self, changes: ChangeSet) -> Result<()>;

    /// Loads the stored state of an aggregate.
    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<StoredAggregate>>;
}

/// Queue side of the outbox, used by the publisher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` unprocessed rows, oldest `occurred_at` first.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Writes back the retry bookkeeping of the given rows in one transaction.
    /// Rows already processed are left as they are.
    async fn update_outbox(&self, messages: &[OutboxMessage]) -> Result<()>;

    async fn get_outbox(&self, id: MessageId) -> Result<Option<OutboxMessage>>;
}

/// Durable intake of a consuming service.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Persists one inbound message.
    async fn save(&self, record: InboxRecord) -> Result<()>;

    /// Returns up to `limit` unprocessed rows whose `next_attempt_at <= now`,
    /// oldest `occurred_at` first.
    async fn get_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<InboxRecord>>;

    /// Writes back the retry bookkeeping of one row, unless it is already
    /// processed.
    async fn update_inbox(&self, record: &InboxRecord) -> Result<()>;

    async fn get_inbox(&self, id: MessageId) -> Result<Option<InboxRecord>>;
}

/// Extension trait providing convenience methods for inbox stores.
#[async_trait]
pub trait InboxStoreExt: InboxStore {
    /// Converts a broker delivery into an inbox row and saves it.
    async fn receive(&self, delivery: Delivery, now: DateTime<Utc>) -> Result<InboxRecord> {
        let record = InboxRecord::from_delivery(delivery, now)?;
        self.save(record.clone()).await?;
        tracing::debug!(
            message_id = %record.id,
            event_id = %record.event_id,
            event_type = %record.event_type,
            "inbox message received"
        );
        Ok(record)
    }
}

// Blanket implementation for all InboxStore implementations
impl<T: InboxStore + ?Sized> InboxStoreExt for T {}
