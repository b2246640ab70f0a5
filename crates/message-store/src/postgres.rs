use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateState, ChangeSet, EventId, Headers, InboxRecord, MessageId,
    OutboxMessage, Result, RetryState, StoreError, StoredAggregate, Version,
    store::{InboxStore, OutboxStore, TransactionalStore},
};

const OUTBOX_COLUMNS: &str = "id, event_id, aggregate_id, aggregate_type, event_type, version, \
     topic, key, headers, payload, occurred_at, processed, processed_at, retry_count, \
     last_error, next_attempt_at";

const INBOX_COLUMNS: &str = "id, event_id, aggregate_id, aggregate_type, event_type, version, \
     topic, key, headers, payload, is_tombstone, occurred_at, processed, processed_at, \
     retry_count, last_error, next_attempt_at";

/// PostgreSQL-backed message store.
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// A write-back that matched no unprocessed row is a no-op when the row
    /// exists and is already processed.
    async fn ensure_settled(
        conn: &mut sqlx::PgConnection,
        table: &str,
        id: MessageId,
    ) -> Result<()> {
        let processed: Option<bool> =
            sqlx::query_scalar(&format!("SELECT processed FROM {table} WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(conn)
                .await?;
        match processed {
            Some(true) => {
                tracing::debug!(
                    message_id = %id,
                    table,
                    "stale write-back ignored, row already processed"
                );
                Ok(())
            }
            _ => Err(StoreError::MessageNotFound(id)),
        }
    }

    fn row_to_retry(row: &PgRow) -> Result<RetryState> {
        Ok(RetryState {
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
        })
    }

    fn row_to_headers(row: &PgRow) -> Result<Option<Headers>> {
        let raw: Option<serde_json::Value> = row.try_get("headers")?;
        Ok(raw.map(serde_json::from_value).transpose()?)
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            version: row.try_get("version")?,
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            headers: Self::row_to_headers(&row)?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            retry: Self::row_to_retry(&row)?,
        })
    }

    fn row_to_inbox(row: PgRow) -> Result<InboxRecord> {
        Ok(InboxRecord {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            version: row.try_get("version")?,
            topic: row.try_get("topic")?,
            key: row.try_get("key")?,
            headers: Self::row_to_headers(&row)?,
            payload: row.try_get("payload")?,
            is_tombstone: row.try_get("is_tombstone")?,
            occurred_at: row.try_get("occurred_at")?,
            retry: Self::row_to_retry(&row)?,
        })
    }

    async fn write_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        staged: &AggregateState,
    ) -> Result<()> {
        let next = staged.expected_version.next();

        let rows_affected = if staged.expected_version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO aggregates (aggregate_id, aggregate_type, version, state, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (aggregate_id) DO NOTHING
                "#,
            )
            .bind(staged.aggregate_id.as_uuid())
            .bind(&staged.aggregate_type)
            .bind(next.as_i64())
            .bind(&staged.state)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE aggregates
                SET aggregate_type = $2, version = $3, state = $4, updated_at = NOW()
                WHERE aggregate_id = $1 AND version = $5
                "#,
            )
            .bind(staged.aggregate_id.as_uuid())
            .bind(&staged.aggregate_type)
            .bind(next.as_i64())
            .bind(&staged.state)
            .bind(staged.expected_version.as_i64())
            .execute(&mut **tx)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM aggregates WHERE aggregate_id = $1")
                    .bind(staged.aggregate_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await?;
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id: staged.aggregate_id,
                expected: staged.expected_version,
                actual: Version::new(actual.unwrap_or(0)),
            });
        }
        Ok(())
    }

    async fn insert_outbox(
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> Result<()> {
        let headers = message
            .headers
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(&format!(
            "INSERT INTO outbox_messages ({OUTBOX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(message.id.as_uuid())
        .bind(message.event_id.as_uuid())
        .bind(message.aggregate_id.as_uuid())
        .bind(&message.aggregate_type)
        .bind(&message.event_type)
        .bind(message.version)
        .bind(&message.topic)
        .bind(&message.key)
        .bind(headers)
        .bind(&message.payload)
        .bind(message.occurred_at)
        .bind(message.retry.processed)
        .bind(message.retry.processed_at)
        .bind(message.retry.retry_count)
        .bind(&message.retry.last_error)
        .bind(message.retry.next_attempt_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PostgresMessageStore {
    async fn persist(&self, changes: ChangeSet) -> Result<()> {
        changes.validate()?;

        // Dropping the transaction on any early return rolls everything back
        let mut tx = self.pool.begin().await?;

        for staged in &changes.aggregates {
            Self::write_aggregate(&mut tx, staged).await?;
        }
        for message in &changes.outbox {
            Self::insert_outbox(&mut tx, message).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<StoredAggregate>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state, updated_at
            FROM aggregates
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(StoredAggregate {
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                state: row.try_get("state")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresMessageStore {
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
             WHERE processed = FALSE \
             ORDER BY occurred_at ASC \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn update_outbox(&self, messages: &[OutboxMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for message in messages {
            let rows_affected = sqlx::query(
                r#"
                UPDATE outbox_messages
                SET processed = $2, processed_at = $3, retry_count = $4,
                    last_error = $5, next_attempt_at = $6
                WHERE id = $1 AND processed = FALSE
                "#,
            )
            .bind(message.id.as_uuid())
            .bind(message.retry.processed)
            .bind(message.retry.processed_at)
            .bind(message.retry.retry_count)
            .bind(&message.retry.last_error)
            .bind(message.retry.next_attempt_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows_affected == 0 {
                Self::ensure_settled(&mut *tx, "outbox_messages", message.id).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_outbox(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_outbox).transpose()
    }
}

#[async_trait]
impl InboxStore for PostgresMessageStore {
    async fn save(&self, record: InboxRecord) -> Result<()> {
        record.validate()?;
        let headers = record
            .headers
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        sqlx::query(&format!(
            "INSERT INTO inbox_messages ({INBOX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(record.id.as_uuid())
        .bind(record.event_id.as_uuid())
        .bind(record.aggregate_id.as_uuid())
        .bind(&record.aggregate_type)
        .bind(&record.event_type)
        .bind(record.version)
        .bind(&record.topic)
        .bind(&record.key)
        .bind(headers)
        .bind(&record.payload)
        .bind(record.is_tombstone)
        .bind(record.occurred_at)
        .bind(record.retry.processed)
        .bind(record.retry.processed_at)
        .bind(record.retry.retry_count)
        .bind(&record.retry.last_error)
        .bind(record.retry.next_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<InboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_messages \
             WHERE processed = FALSE AND next_attempt_at <= $1 \
             ORDER BY occurred_at ASC \
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_inbox).collect()
    }

    async fn update_inbox(&self, record: &InboxRecord) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE inbox_messages
            SET processed = $2, processed_at = $3, retry_count = $4,
                last_error = $5, next_attempt_at = $6
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.retry.processed)
        .bind(record.retry.processed_at)
        .bind(record.retry.retry_count)
        .bind(&record.retry.last_error)
        .bind(record.retry.next_attempt_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let mut conn = self.pool.acquire().await?;
            Self::ensure_settled(&mut *conn, "inbox_messages", record.id).await?;
        }
        Ok(())
    }

    async fn get_inbox(&self, id: MessageId) -> Result<Option<InboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_inbox).transpose()
    }
}
