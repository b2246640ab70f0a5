//! Loading aggregates from their stored state.

use common::AggregateId;
use message_store::TransactionalStore;
use serde::de::DeserializeOwned;

use crate::aggregate::AggregateRoot;
use crate::error::{DomainError, Result};

/// Loads an aggregate, restoring its version from the stored row.
///
/// Returns `Ok(None)` when no row exists and `AggregateTypeMismatch` when the
/// row belongs to another aggregate type.
pub async fn load_aggregate<S, A>(store: &S, id: AggregateId) -> Result<Option<A>>
where
    S: TransactionalStore + ?Sized,
    A: AggregateRoot + DeserializeOwned,
{
    let Some(stored) = store.get_aggregate(id).await? else {
        return Ok(None);
    };

    if stored.aggregate_type != A::aggregate_type() {
        return Err(DomainError::AggregateTypeMismatch {
            aggregate_id: id,
            expected: A::aggregate_type(),
            actual: stored.aggregate_type,
        });
    }

    let mut aggregate: A = serde_json::from_value(stored.state)?;
    aggregate.set_version(stored.version);
    Ok(Some(aggregate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{DomainEvent, EventLog};
    use message_store::{AggregateState, ChangeSet, InMemoryMessageStore, Version};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noop;

    impl DomainEvent for Noop {
        fn event_type(&self) -> &'static str {
            "Noop"
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Team {
        id: AggregateId,
        members: Vec<String>,
        #[serde(skip)]
        version: Version,
        #[serde(skip)]
        events: EventLog<Noop>,
    }

    impl AggregateRoot for Team {
        type Event = Noop;

        fn aggregate_type() -> &'static str {
            "Team"
        }

        fn id(&self) -> AggregateId {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn event_log(&self) -> &EventLog<Noop> {
            &self.events
        }

        fn event_log_mut(&mut self) -> &mut EventLog<Noop> {
            &mut self.events
        }
    }

    async fn seed(store: &InMemoryMessageStore, id: AggregateId, aggregate_type: &str) {
        store
            .persist(ChangeSet::new().with_aggregate(AggregateState {
                aggregate_id: id,
                aggregate_type: aggregate_type.into(),
                expected_version: Version::initial(),
                state: serde_json::json!({"id": id, "members": ["U1"]}),
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_aggregate_is_none() {
        let store = InMemoryMessageStore::new();
        let loaded: Option<Team> = load_aggregate(&store, AggregateId::new()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn restores_state_and_version() {
        let store = InMemoryMessageStore::new();
        let id = AggregateId::new();
        seed(&store, id, "Team").await;

        let team: Team = load_aggregate(&store, id).await.unwrap().unwrap();
        assert_eq!(team.members, vec!["U1"]);
        assert_eq!(team.version(), Version::new(1));
    }

    #[tokio::test]
    async fn rejects_other_aggregate_type() {
        let store = InMemoryMessageStore::new();
        let id = AggregateId::new();
        seed(&store, id, "Project").await;

        let result: Result<Option<Team>> = load_aggregate(&store, id).await;
        assert!(matches!(
            result,
            Err(DomainError::AggregateTypeMismatch { actual, .. }) if actual == "Project"
        ));
    }
}
