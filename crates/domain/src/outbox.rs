//! Outbox writer: stages integration messages inside a unit of work.

use common::{AggregateId, EventId, SharedClock};
use message_store::{Headers, OutboxMessage};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DomainError, Result};

/// Event type used for payload-less deletion markers.
pub const TOMBSTONE_EVENT_TYPE: &str = "Tombstone";

/// A message meant for other services.
pub trait IntegrationEvent: Serialize + Send + Sync {
    /// Routing key consumers select handlers by.
    fn event_type(&self) -> &'static str;

    fn aggregate_id(&self) -> AggregateId;

    fn aggregate_type(&self) -> &'static str;

    /// Schema version tag. Bump when the payload shape changes.
    fn schema_version(&self) -> i32 {
        1
    }
}

/// Serializes a value with object keys sorted and null fields dropped, so the
/// same message always produces byte-identical payloads.
pub fn stable_payload<T: Serialize + ?Sized>(value: &T) -> std::result::Result<String, serde_json::Error> {
    let value = canonicalize(serde_json::to_value(value)?);
    serde_json::to_string(&value)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.into_iter().filter(|(_, v)| !v.is_null()).collect();
            fields.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(fields.len());
            for (name, field) in fields {
                sorted.insert(name, canonicalize(field));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Collects outbox rows for the enclosing unit of work.
///
/// Only reachable through [`UnitOfWork::outbox`](crate::UnitOfWork::outbox):
/// rows cannot be staged outside a transaction, and nothing is visible until
/// the unit commits.
pub struct OutboxWriter {
    clock: SharedClock,
    staged: Vec<OutboxMessage>,
}

impl OutboxWriter {
    pub(crate) fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            staged: Vec::new(),
        }
    }

    /// Stages `message` for publication on `topic` under `key`.
    pub fn add<M: IntegrationEvent>(&mut self, message: &M, topic: &str, key: &str) -> Result<EventId> {
        self.add_with_headers(message, topic, key, Headers::new())
    }

    /// Like [`add`](Self::add), with extra broker headers.
    pub fn add_with_headers<M: IntegrationEvent>(
        &mut self,
        message: &M,
        topic: &str,
        key: &str,
        headers: Headers,
    ) -> Result<EventId> {
        let payload = stable_payload(message)?;
        let row = OutboxMessage::builder()
            .aggregate(message.aggregate_id(), message.aggregate_type())
            .event_type(message.event_type())
            .version(message.schema_version())
            .topic(topic)
            .key(key)
            .headers(headers)
            .payload(payload)
            .occurred_at(self.clock.now())
            .try_build()
            .map_err(|e| DomainError::InvalidMessage(e.to_string()))?;
        Ok(self.stage(row))
    }

    /// Stages a payload-less tombstone retracting `key` on `topic`.
    pub fn add_tombstone(&mut self, topic: &str, key: &str) -> Result<EventId> {
        if key.is_empty() {
            return Err(DomainError::InvalidMessage(
                "tombstones require a non-empty key".to_string(),
            ));
        }
        let row = OutboxMessage::builder()
            .aggregate(AggregateId::nil(), topic)
            .event_type(TOMBSTONE_EVENT_TYPE)
            .topic(topic)
            .key(key)
            .occurred_at(self.clock.now())
            .try_build()
            .map_err(|e| DomainError::InvalidMessage(e.to_string()))?;
        Ok(self.stage(row))
    }

    /// Rows staged so far, in call order.
    pub fn staged(&self) -> &[OutboxMessage] {
        &self.staged
    }

    pub(crate) fn take(&mut self) -> Vec<OutboxMessage> {
        std::mem::take(&mut self.staged)
    }

    fn stage(&mut self, row: OutboxMessage) -> EventId {
        let event_id = row.event_id;
        tracing::debug!(
            event_id = %event_id,
            event_type = %row.event_type,
            topic = %row.topic,
            tombstone = row.is_tombstone(),
            "outbox message staged"
        );
        self.staged.push(row);
        event_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Clock, ManualClock};

    #[derive(Serialize)]
    struct MemberAdded {
        project_id: AggregateId,
        user_id: String,
        role: Option<String>,
        tags: Vec<Option<String>>,
    }

    impl IntegrationEvent for MemberAdded {
        fn event_type(&self) -> &'static str {
            "MemberAdded"
        }

        fn aggregate_id(&self) -> AggregateId {
            self.project_id
        }

        fn aggregate_type(&self) -> &'static str {
            "Project"
        }

        fn schema_version(&self) -> i32 {
            2
        }
    }

    fn member_added() -> MemberAdded {
        MemberAdded {
            project_id: AggregateId::new(),
            user_id: "U1".into(),
            role: None,
            tags: vec![Some("a".into()), None],
        }
    }

    #[test]
    fn stable_payload_sorts_keys_and_drops_nulls() {
        let payload = stable_payload(&serde_json::json!({
            "zeta": 1,
            "alpha": {"b": null, "a": 2},
            "mid": null,
            "list": [null, {"y": 1, "x": null}]
        }))
        .unwrap();

        assert_eq!(payload, r#"{"alpha":{"a":2},"list":[null,{"y":1}],"zeta":1}"#);
    }

    #[test]
    fn stable_payload_is_deterministic() {
        let message = member_added();
        assert_eq!(
            stable_payload(&message).unwrap(),
            stable_payload(&message).unwrap()
        );
    }

    #[test]
    fn add_stages_pending_row() {
        let clock = ManualClock::starting_now();
        let mut writer = OutboxWriter::new(clock.shared());
        let message = member_added();

        let event_id = writer.add(&message, "members", "P1:U1").unwrap();

        let row = &writer.staged()[0];
        assert_eq!(row.event_id, event_id);
        assert_eq!(row.event_type, "MemberAdded");
        assert_eq!(row.aggregate_id, message.project_id);
        assert_eq!(row.aggregate_type, "Project");
        assert_eq!(row.version, 2);
        assert_eq!(row.topic, "members");
        assert_eq!(row.key, "P1:U1");
        assert_eq!(row.occurred_at, clock.now());
        assert!(!row.retry.processed);
        assert_eq!(row.retry.retry_count, 0);
        let payload = row.payload.as_deref().unwrap();
        assert!(!payload.contains("role"));
        assert!(payload.contains(r#""user_id":"U1""#));
    }

    #[test]
    fn add_with_headers_keeps_caller_headers() {
        let mut writer = OutboxWriter::new(ManualClock::starting_now().shared());
        let mut headers = Headers::new();
        headers.insert("correlation-id".into(), "req-42".into());

        writer
            .add_with_headers(&member_added(), "members", "P1:U1", headers)
            .unwrap();

        let row = &writer.staged()[0];
        assert_eq!(row.headers.as_ref().unwrap()["correlation-id"], "req-42");
    }

    #[test]
    fn tombstone_has_no_payload() {
        let mut writer = OutboxWriter::new(ManualClock::starting_now().shared());
        writer.add_tombstone("members", "P1:U1").unwrap();

        let row = &writer.staged()[0];
        assert!(row.payload.is_none());
        assert!(row.is_tombstone());
        assert_eq!(row.event_type, TOMBSTONE_EVENT_TYPE);
        assert_eq!(row.key, "P1:U1");
        assert!(row.aggregate_id.is_nil());
    }

    #[test]
    fn tombstone_rejects_empty_key() {
        let mut writer = OutboxWriter::new(ManualClock::starting_now().shared());
        assert!(matches!(
            writer.add_tombstone("members", ""),
            Err(DomainError::InvalidMessage(_))
        ));
        assert!(writer.staged().is_empty());
    }

    #[test]
    fn take_drains_staged_rows() {
        let mut writer = OutboxWriter::new(ManualClock::starting_now().shared());
        writer.add(&member_added(), "members", "P1:U1").unwrap();
        assert_eq!(writer.take().len(), 1);
        assert!(writer.staged().is_empty());
    }
}
