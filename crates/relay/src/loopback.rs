//! Broker that delivers straight into an inbox.

use std::sync::Arc;

use async_trait::async_trait;
use common::{SharedClock, SystemClock};
use message_store::{Delivery, Headers, InboxStore, InboxStoreExt};

use crate::broker::MessageBroker;
use crate::error::BrokerError;

/// Publishes by saving each message as an inbox row of `store`.
///
/// Used when producer and consumer share one process and one store: the
/// publisher marks a row processed only once its inbox copy is durable, and
/// the inbox processor picks it up from there.
pub struct LoopbackBroker<S: InboxStore + ?Sized> {
    store: Arc<S>,
    clock: SharedClock,
}

impl<S: InboxStore + ?Sized> LoopbackBroker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, SystemClock::shared())
    }

    pub fn with_clock(store: Arc<S>, clock: SharedClock) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl<S: InboxStore + ?Sized> MessageBroker for LoopbackBroker<S> {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Option<&str>,
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let delivery = Delivery {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.map(str::to_string),
            headers: headers.clone(),
        };
        let record = self
            .store
            .receive(delivery, self.clock.now())
            .await
            .map_err(|e| BrokerError::new(format!("loopback delivery on {topic} failed: {e}")))?;
        tracing::debug!(message_id = %record.id, topic, "delivered to local inbox");
        Ok(())
    }
}
