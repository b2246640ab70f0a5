use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SharedClock, SystemClock};
use tokio::sync::RwLock;

use crate::{
    AggregateId, ChangeSet, InboxRecord, MessageId, OutboxMessage, Result, StoreError,
    StoredAggregate, Version,
    store::{InboxStore, OutboxStore, TransactionalStore},
};

#[derive(Debug, Default)]
struct Tables {
    aggregates: HashMap<AggregateId, StoredAggregate>,
    outbox: Vec<OutboxMessage>,
    inbox: Vec<InboxRecord>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_on_persist: AtomicBool,
    failing_fetches: AtomicU32,
}

impl Faults {
    fn take_fetch_failure(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory message store for testing and single-process deployments.
///
/// All three tables sit behind one lock, so a change set is applied under a
/// single write guard and is never observed half-written.
#[derive(Clone)]
pub struct InMemoryMessageStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Faults>,
    clock: SharedClock,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl std::fmt::Debug for InMemoryMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMessageStore")
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

impl InMemoryMessageStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that stamps aggregate rows with `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            faults: Arc::new(Faults::default()),
            clock,
        }
    }

    /// Makes every `persist` call fail until reset, simulating a crash
    /// before the transaction commits.
    pub fn set_fail_on_persist(&self, fail: bool) {
        self.faults.fail_on_persist.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `n` fetches (`fetch_unprocessed` / `get_pending`) fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.faults.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub async fn outbox_count(&self) -> usize {
        self.tables.read().await.outbox.len()
    }

    pub async fn inbox_count(&self) -> usize {
        self.tables.read().await.inbox.len()
    }

    pub async fn aggregate_count(&self) -> usize {
        self.tables.read().await.aggregates.len()
    }

    /// Returns every outbox row in insertion order.
    pub async fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.tables.read().await.outbox.clone()
    }

    /// Returns every inbox row in insertion order.
    pub async fn inbox_records(&self) -> Vec<InboxRecord> {
        self.tables.read().await.inbox.clone()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.aggregates.clear();
        tables.outbox.clear();
        tables.inbox.clear();
    }
}

#[async_trait]
impl TransactionalStore for InMemoryMessageStore {
    async fn persist(&self, changes: ChangeSet) -> Result<()> {
        changes.validate()?;

        if self.faults.fail_on_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected failure before commit".to_string(),
            ));
        }

        let mut tables = self.tables.write().await;

        // Check every precondition before touching any table
        for staged in &changes.aggregates {
            let actual = tables
                .aggregates
                .get(&staged.aggregate_id)
                .map(|a| a.version)
                .unwrap_or(Version::initial());
            if actual != staged.expected_version {
                return Err(StoreError::ConcurrencyConflict {
                    aggregate_id: staged.aggregate_id,
                    expected: staged.expected_version,
                    actual,
                });
            }
        }
        for message in &changes.outbox {
            if tables.outbox.iter().any(|m| m.id == message.id) {
                return Err(StoreError::InvalidRecord(format!(
                    "outbox message {} already exists",
                    message.id
                )));
            }
        }

        let now = self.clock.now();
        for staged in changes.aggregates {
            tables.aggregates.insert(
                staged.aggregate_id,
                StoredAggregate {
                    aggregate_id: staged.aggregate_id,
                    aggregate_type: staged.aggregate_type,
                    version: staged.expected_version.next(),
                    state: staged.state,
                    updated_at: now,
                },
            );
        }
        tables.outbox.extend(changes.outbox);

        Ok(())
    }

    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<StoredAggregate>> {
        let tables = self.tables.read().await;
        Ok(tables.aggregates.get(&aggregate_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryMessageStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        if self.faults.take_fetch_failure() {
            return Err(StoreError::Unavailable("injected fetch failure".to_string()));
        }

        let tables = self.tables.read().await;
        let mut pending: Vec<_> = tables
            .outbox
            .iter()
            .filter(|m| !m.retry.processed)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|m| m.occurred_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_outbox(&self, messages: &[OutboxMessage]) -> Result<()> {
        let mut tables = self.tables.write().await;

        let mut positions = Vec::with_capacity(messages.len());
        for message in messages {
            let position = tables
                .outbox
                .iter()
                .position(|m| m.id == message.id)
                .ok_or(StoreError::MessageNotFound(message.id))?;
            positions.push(position);
        }

        for (position, message) in positions.into_iter().zip(messages) {
            let row = &mut tables.outbox[position];
            if row.retry.processed {
                tracing::debug!(message_id = %row.id, "stale outbox write-back ignored");
                continue;
            }
            row.retry = message.retry.clone();
        }
        Ok(())
    }

    async fn get_outbox(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().find(|m| m.id == id).cloned())
    }
}

#[async_trait]
impl InboxStore for InMemoryMessageStore {
    async fn save(&self, record: InboxRecord) -> Result<()> {
        record.validate()?;
        let mut tables = self.tables.write().await;
        if tables.inbox.iter().any(|r| r.id == record.id) {
            return Err(StoreError::InvalidRecord(format!(
                "inbox record {} already exists",
                record.id
            )));
        }
        tables.inbox.push(record);
        Ok(())
    }

    async fn get_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<InboxRecord>> {
        if self.faults.take_fetch_failure() {
            return Err(StoreError::Unavailable("injected fetch failure".to_string()));
        }

        let tables = self.tables.read().await;
        let mut pending: Vec<_> = tables
            .inbox
            .iter()
            .filter(|r| r.retry.is_due(now))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.occurred_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_inbox(&self, record: &InboxRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .inbox
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(StoreError::MessageNotFound(record.id))?;
        if row.retry.processed {
            tracing::debug!(message_id = %row.id, "stale inbox write-back ignored");
            return Ok(());
        }
        row.retry = record.retry.clone();
        Ok(())
    }

    async fn get_inbox(&self, id: MessageId) -> Result<Option<InboxRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.inbox.iter().find(|r| r.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregateState, Delivery, InboxStoreExt};
    use chrono::Duration;

    fn outbox_message(key: &str, occurred_at: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage::builder()
            .aggregate(AggregateId::new(), "Project")
            .event_type("MemberAdded")
            .topic("members")
            .key(key)
            .payload("{}")
            .occurred_at(occurred_at)
            .try_build()
            .unwrap()
    }

    fn aggregate_state(id: AggregateId, expected: Version) -> AggregateState {
        AggregateState {
            aggregate_id: id,
            aggregate_type: "Project".into(),
            expected_version: expected,
            state: serde_json::json!({"members": ["U1"]}),
        }
    }

    #[tokio::test]
    async fn persist_writes_state_and_outbox_together() {
        let store = InMemoryMessageStore::new();
        let id = AggregateId::new();
        let changes = ChangeSet::new()
            .with_aggregate(aggregate_state(id, Version::initial()))
            .with_outbox(outbox_message("P1:U1", Utc::now()));

        store.persist(changes).await.unwrap();

        let stored = store.get_aggregate(id).await.unwrap().unwrap();
        assert_eq!(stored.version, Version::new(1));
        assert_eq!(store.outbox_count().await, 1);
    }

    #[tokio::test]
    async fn concurrency_conflict_writes_nothing() {
        let store = InMemoryMessageStore::new();
        let id = AggregateId::new();
        store
            .persist(ChangeSet::new().with_aggregate(aggregate_state(id, Version::initial())))
            .await
            .unwrap();

        // Stale writer still believes the aggregate is new
        let other = AggregateId::new();
        let stale = ChangeSet::new()
            .with_aggregate(aggregate_state(other, Version::initial()))
            .with_aggregate(aggregate_state(id, Version::initial()))
            .with_outbox(outbox_message("P1:U2", Utc::now()));

        let result = store.persist(stale).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { actual, .. }) if actual == Version::new(1)
        ));
        assert_eq!(store.outbox_count().await, 0);
        assert!(store.get_aggregate(other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_persist_failure_writes_nothing() {
        let store = InMemoryMessageStore::new();
        store.set_fail_on_persist(true);

        let changes = ChangeSet::new()
            .with_aggregate(aggregate_state(AggregateId::new(), Version::initial()))
            .with_outbox(outbox_message("P1:U1", Utc::now()));

        assert!(matches!(
            store.persist(changes).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.outbox_count().await, 0);
        assert_eq!(store.aggregate_count().await, 0);
    }

    #[tokio::test]
    async fn fetch_unprocessed_orders_by_occurred_at_and_limits() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let late = outbox_message("late", now);
        let early = outbox_message("early", now - Duration::seconds(10));
        let middle = outbox_message("middle", now - Duration::seconds(5));
        store
            .persist(
                ChangeSet::new()
                    .with_outbox(late)
                    .with_outbox(early)
                    .with_outbox(middle),
            )
            .await
            .unwrap();

        let batch = store.fetch_unprocessed(2).await.unwrap();
        let keys: Vec<_> = batch.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["early", "middle"]);
    }

    #[tokio::test]
    async fn processed_rows_are_not_fetched() {
        let store = InMemoryMessageStore::new();
        store
            .persist(ChangeSet::new().with_outbox(outbox_message("k", Utc::now())))
            .await
            .unwrap();

        let mut batch = store.fetch_unprocessed(10).await.unwrap();
        batch[0].retry.complete(Utc::now());
        store.update_outbox(&batch).await.unwrap();

        assert!(store.fetch_unprocessed(10).await.unwrap().is_empty());
        let row = store.get_outbox(batch[0].id).await.unwrap().unwrap();
        assert!(row.is_processed());
    }

    #[tokio::test]
    async fn update_unknown_outbox_row_fails_without_partial_write() {
        let store = InMemoryMessageStore::new();
        store
            .persist(ChangeSet::new().with_outbox(outbox_message("k", Utc::now())))
            .await
            .unwrap();

        let mut known = store.fetch_unprocessed(10).await.unwrap().remove(0);
        known.retry.complete(Utc::now());
        let unknown = outbox_message("ghost", Utc::now());

        let result = store.update_outbox(&[known.clone(), unknown.clone()]).await;
        assert!(matches!(result, Err(StoreError::MessageNotFound(id)) if id == unknown.id));
        assert!(!store.get_outbox(known.id).await.unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    async fn processed_rows_ignore_stale_write_back() {
        let store = InMemoryMessageStore::new();
        store
            .persist(ChangeSet::new().with_outbox(outbox_message("k", Utc::now())))
            .await
            .unwrap();

        let mut stale = store.fetch_unprocessed(10).await.unwrap();
        let mut fresh = store.fetch_unprocessed(10).await.unwrap();
        fresh[0].retry.complete(Utc::now());
        store.update_outbox(&fresh).await.unwrap();
        stale[0].retry.fail("broker down", Utc::now());
        store.update_outbox(&stale).await.unwrap();

        let row = store.get_outbox(fresh[0].id).await.unwrap().unwrap();
        assert!(row.is_processed());
        assert_eq!(row.retry.retry_count, 0);

        let now = Utc::now();
        let record = store
            .receive(outbox_message("k", now).to_delivery(), now)
            .await
            .unwrap();
        let mut stale = record.clone();
        let mut fresh = record;
        fresh.retry.complete(now);
        store.update_inbox(&fresh).await.unwrap();
        stale.retry.fail("handler failed", now + Duration::seconds(5));
        store.update_inbox(&stale).await.unwrap();

        let row = store.get_inbox(fresh.id).await.unwrap().unwrap();
        assert!(row.retry.processed);
        assert_eq!(row.retry.retry_count, 0);
    }

    #[tokio::test]
    async fn aggregate_rows_are_stamped_by_the_clock() {
        let clock = common::ManualClock::starting_now();
        let store = InMemoryMessageStore::with_clock(clock.shared());
        clock.advance(Duration::minutes(3));
        let id = AggregateId::new();

        store
            .persist(ChangeSet::new().with_aggregate(AggregateState {
                aggregate_id: id,
                aggregate_type: "Project".into(),
                expected_version: Version::initial(),
                state: serde_json::json!({}),
            }))
            .await
            .unwrap();

        let row = store.get_aggregate(id).await.unwrap().unwrap();
        assert_eq!(row.updated_at, common::Clock::now(&clock));
    }

    #[tokio::test]
    async fn injected_fetch_failures_are_consumed() {
        let store = InMemoryMessageStore::new();
        store.fail_next_fetches(2);

        assert!(store.fetch_unprocessed(1).await.is_err());
        assert!(store.get_pending(1, Utc::now()).await.is_err());
        assert!(store.fetch_unprocessed(1).await.is_ok());
    }

    #[tokio::test]
    async fn get_pending_respects_next_attempt_at() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let delivery = outbox_message("P1:U1", now).to_delivery();
        let mut record = store.receive(delivery, now).await.unwrap();

        assert_eq!(store.get_pending(10, now).await.unwrap().len(), 1);

        record.retry.fail("boom", now + Duration::seconds(30));
        store.update_inbox(&record).await.unwrap();

        assert!(store.get_pending(10, now).await.unwrap().is_empty());
        let later = store
            .get_pending(10, now + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].retry.retry_count, 1);
    }

    #[tokio::test]
    async fn save_rejects_invalid_inbox_record() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let mut record = InboxRecord::from_delivery(
            Delivery {
                topic: "members".into(),
                key: "P1:U1".into(),
                payload: Some("{}".into()),
                headers: outbox_message("P1:U1", now).envelope_headers(),
            },
            now,
        )
        .unwrap();
        record.payload = None;

        assert!(store.save(record).await.is_err());
        assert_eq!(store.inbox_count().await, 0);
    }
}
