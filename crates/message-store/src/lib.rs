pub mod changes;
pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod store;

pub use changes::{AggregateState, ChangeSet, StoredAggregate, Version};
pub use common::{AggregateId, EventId, MessageId};
pub use error::{Result, StoreError};
pub use memory::InMemoryMessageStore;
pub use message::{
    Delivery, Headers, InboxRecord, OutboxMessage, OutboxMessageBuilder, RetryState, headers,
};
pub use postgres::PostgresMessageStore;
pub use store::{InboxStore, InboxStoreExt, OutboxStore, TransactionalStore};
