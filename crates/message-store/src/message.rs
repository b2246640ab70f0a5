use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, EventId, MessageId, Result, StoreError};

/// String-to-string message metadata. Ordered so serialized rows are stable.
pub type Headers = BTreeMap<String, String>;

/// Envelope header names the publisher attaches to every broker message.
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const AGGREGATE_ID: &str = "aggregate-id";
    pub const AGGREGATE_TYPE: &str = "aggregate-type";
    pub const EVENT_VERSION: &str = "event-version";
    pub const OCCURRED_AT: &str = "occurred-at";
}

/// Retry bookkeeping shared by outbox and inbox rows.
///
/// `processed` is terminal: once set, every mutator is a no-op. `retry_count`
/// only grows and `next_attempt_at` strictly increases on each failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

impl RetryState {
    /// A fresh, immediately eligible state.
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            processed: false,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: now,
        }
    }

    /// Marks the row as successfully handled. Returns false if it was
    /// already terminal.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        self.processed = true;
        self.processed_at = Some(now);
        self.last_error = None;
        true
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// The scheduled instant is pushed at least one millisecond past the
    /// previous one, so `next_attempt_at` never stalls even if the clock does.
    pub fn fail(&mut self, error: impl Into<String>, next_attempt_at: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        self.retry_count += 1;
        self.last_error = Some(error.into());
        let floor = self.next_attempt_at + Duration::milliseconds(1);
        self.next_attempt_at = next_attempt_at.max(floor);
        true
    }

    /// Abandons the row after a failure. `last_error` is kept for diagnosis.
    pub fn give_up(&mut self, now: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        self.processed = true;
        self.processed_at = Some(now);
        true
    }

    /// Whether the row may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.next_attempt_at <= now
    }
}

/// A raw message as it travels over the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub topic: String,
    pub key: String,
    pub payload: Option<String>,
    pub headers: Headers,
}

/// A durable to-be-published event, written in the same transaction as the
/// state change that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    /// Schema version tag of the payload.
    pub version: i32,
    pub topic: String,
    pub key: String,
    pub headers: Option<Headers>,
    /// `None` marks a tombstone.
    pub payload: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub retry: RetryState,
}

impl OutboxMessage {
    /// Creates a new outbox message builder.
    pub fn builder() -> OutboxMessageBuilder {
        OutboxMessageBuilder::default()
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is_processed(&self) -> bool {
        self.retry.processed
    }

    /// Headers sent to the broker: the row's own headers with the envelope
    /// headers layered on top.
    pub fn envelope_headers(&self) -> Headers {
        let mut out = self.headers.clone().unwrap_or_default();
        out.insert(headers::EVENT_ID.into(), self.event_id.to_string());
        out.insert(headers::EVENT_TYPE.into(), self.event_type.clone());
        out.insert(headers::AGGREGATE_ID.into(), self.aggregate_id.to_string());
        out.insert(headers::AGGREGATE_TYPE.into(), self.aggregate_type.clone());
        out.insert(headers::EVENT_VERSION.into(), self.version.to_string());
        out.insert(headers::OCCURRED_AT.into(), self.occurred_at.to_rfc3339());
        out
    }

    /// Converts the row into the message handed to the broker.
    pub fn to_delivery(&self) -> Delivery {
        Delivery {
            topic: self.topic.clone(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            headers: self.envelope_headers(),
        }
    }

    /// Checks the invariants a freshly staged row must satisfy.
    pub fn validate_new(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "outbox message {} has an empty topic",
                self.id
            )));
        }
        if self.is_tombstone() && self.key.is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "tombstone {} requires a non-empty key",
                self.id
            )));
        }
        if self.retry.processed || self.retry.retry_count != 0 {
            return Err(StoreError::InvalidRecord(format!(
                "outbox message {} must be staged unprocessed",
                self.id
            )));
        }
        Ok(())
    }
}

/// Builder for constructing outbox messages.
#[derive(Debug, Default)]
pub struct OutboxMessageBuilder {
    event_id: Option<EventId>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    event_type: Option<String>,
    version: Option<i32>,
    topic: Option<String>,
    key: Option<String>,
    headers: Headers,
    payload: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

impl OutboxMessageBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn aggregate(mut self, id: AggregateId, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_id = Some(id);
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the schema version. Defaults to 1.
    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Sets the serialized payload. Leave unset for a tombstone.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the occurrence time. If not set, the current time will be used.
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    /// Builds the message, returning an error when a required field is
    /// missing or the row would violate an invariant.
    pub fn try_build(self) -> Result<OutboxMessage> {
        let missing = |field: &str| StoreError::InvalidRecord(format!("{field} is required"));
        let occurred_at = self.occurred_at.unwrap_or_else(Utc::now);
        let message = OutboxMessage {
            id: MessageId::new(),
            event_id: self.event_id.unwrap_or_default(),
            aggregate_id: self.aggregate_id.unwrap_or_else(AggregateId::nil),
            aggregate_type: self.aggregate_type.unwrap_or_default(),
            event_type: self.event_type.ok_or_else(|| missing("event_type"))?,
            version: self.version.unwrap_or(1),
            topic: self.topic.ok_or_else(|| missing("topic"))?,
            key: self.key.unwrap_or_default(),
            headers: (!self.headers.is_empty()).then_some(self.headers),
            payload: self.payload,
            occurred_at,
            retry: RetryState::pending(occurred_at),
        };
        message.validate_new()?;
        Ok(message)
    }
}

/// A received-but-not-yet-applied message in a consuming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: MessageId,
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub version: i32,
    pub topic: String,
    pub key: String,
    pub headers: Option<Headers>,
    pub payload: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub is_tombstone: bool,
    #[serde(flatten)]
    pub retry: RetryState,
}

impl InboxRecord {
    /// Builds an inbox row from a broker delivery.
    ///
    /// `event-id` and `event-type` headers are required; the remaining
    /// envelope headers fall back to defaults when absent.
    pub fn from_delivery(delivery: Delivery, now: DateTime<Utc>) -> Result<Self> {
        let Delivery {
            topic,
            key,
            payload,
            headers,
        } = delivery;

        let required = |name: &str| {
            headers
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StoreError::InvalidRecord(format!("missing header '{name}'")))
        };
        let invalid = |name: &str, value: &str| {
            StoreError::InvalidRecord(format!("malformed header '{name}': {value}"))
        };

        let raw_event_id = required(headers::EVENT_ID)?;
        let event_id: EventId = raw_event_id
            .parse()
            .map_err(|_| invalid(headers::EVENT_ID, raw_event_id))?;
        let event_type = required(headers::EVENT_TYPE)?.clone();

        let aggregate_id = match headers.get(headers::AGGREGATE_ID) {
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid(headers::AGGREGATE_ID, raw))?,
            None => AggregateId::nil(),
        };
        let version = match headers.get(headers::EVENT_VERSION) {
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid(headers::EVENT_VERSION, raw))?,
            None => 1,
        };
        let occurred_at = match headers.get(headers::OCCURRED_AT) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|_| invalid(headers::OCCURRED_AT, raw))?
                .with_timezone(&Utc),
            None => now,
        };
        let aggregate_type = headers
            .get(headers::AGGREGATE_TYPE)
            .cloned()
            .unwrap_or_default();

        let record = Self {
            id: MessageId::new(),
            event_id,
            aggregate_id,
            aggregate_type,
            event_type,
            version,
            topic,
            key,
            is_tombstone: payload.is_none(),
            payload,
            headers: (!headers.is_empty()).then_some(headers),
            occurred_at,
            retry: RetryState::pending(now),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn is_processed(&self) -> bool {
        self.retry.processed
    }

    /// Checks `payload == None` iff `is_tombstone`, and that tombstones carry
    /// a key.
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_none() != self.is_tombstone {
            return Err(StoreError::InvalidRecord(format!(
                "inbox record {}: payload must be absent exactly when is_tombstone is set",
                self.id
            )));
        }
        if self.is_tombstone && self.key.is_empty() {
            return Err(StoreError::InvalidRecord(format!(
                "tombstone {} requires a non-empty key",
                self.id
            )));
        }
        Ok(())
    }
}
