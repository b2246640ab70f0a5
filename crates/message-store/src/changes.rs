//! Atomic change sets: aggregate state rows plus the outbox rows that
//! describe them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, OutboxMessage, Result, StoreError};

/// Version number of a persisted aggregate, used for optimistic concurrency.
///
/// A never-persisted aggregate is at version 0; every committed unit of work
/// that touches it bumps the version by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a new aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// State of one aggregate as staged by a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Version the unit of work loaded; the store writes `expected_version + 1`.
    pub expected_version: Version,
    pub state: serde_json::Value,
}

/// An aggregate row as it exists in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAggregate {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: Version,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Everything one unit of work writes. Stores apply a change set in a single
/// transaction: all rows persist or none do.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub aggregates: Vec<AggregateState>,
    pub outbox: Vec<OutboxMessage>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregate(mut self, state: AggregateState) -> Self {
        self.aggregates.push(state);
        self
    }

    pub fn with_outbox(mut self, message: OutboxMessage) -> Self {
        self.outbox.push(message);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty() && self.outbox.is_empty()
    }

    /// Rejects change sets that no backend could apply consistently.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            if !seen.insert(aggregate.aggregate_id) {
                return Err(StoreError::InvalidRecord(format!(
                    "aggregate {} staged more than once",
                    aggregate.aggregate_id
                )));
            }
        }

        let mut ids = HashSet::with_capacity(self.outbox.len());
        for message in &self.outbox {
            message.validate_new()?;
            if !ids.insert(message.id) {
                return Err(StoreError::InvalidRecord(format!(
                    "outbox message {} staged more than once",
                    message.id
                )));
            }
        }
        Ok(())
    }
}
