//! Broker client abstraction.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use message_store::{Delivery, Headers};

use crate::error::BrokerError;

/// Publishes messages to a message broker.
///
/// A call either reports success or a [`BrokerError`]; an in-flight call is
/// never interrupted by the caller.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Option<&str>,
        headers: &Headers,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct BrokerState {
    deliveries: Vec<Delivery>,
    attempts: u32,
    fail_first: u32,
    always_fail: bool,
}

/// In-memory broker for tests.
///
/// Records every accepted delivery until taken and can be told to reject
/// calls.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `n` publish calls.
    pub fn fail_first(&self, n: u32) {
        self.lock().fail_first = n;
    }

    /// Rejects every publish call while set.
    pub fn set_always_fail(&self, fail: bool) {
        self.lock().always_fail = fail;
    }

    /// Accepted deliveries, in publish order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    /// Removes and returns the accepted deliveries.
    pub fn take_deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.lock().deliveries)
    }

    /// Number of publish calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Option<&str>,
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.attempts += 1;

        if state.always_fail {
            return Err(BrokerError::new(format!("broker rejected message on {topic}")));
        }
        if state.fail_first > 0 {
            state.fail_first -= 1;
            return Err(BrokerError::new(format!("broker unavailable for {topic}")));
        }

        state.deliveries.push(Delivery {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.map(str::to_string),
            headers: headers.clone(),
        });
        Ok(())
    }
}
