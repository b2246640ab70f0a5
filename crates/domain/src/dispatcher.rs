//! In-process event dispatch.
//!
//! Subscribers are registered against event-type names when the service
//! starts; dispatch is a table lookup followed by plain trait calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::EventId;

use crate::aggregate::PendingEvent;
use crate::error::Result;

/// A local subscriber that reacts to committed domain events within the same
/// request.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &PendingEvent) -> Result<()>;
}

/// One subscriber failure during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub event_id: EventId,
    pub event_type: &'static str,
    pub subscriber: &'static str,
    pub error: String,
}

/// Outcome of dispatching a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Successful subscriber invocations.
    pub delivered: usize,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Maps event-type names to the subscribers interested in them.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    routes: HashMap<&'static str, Vec<Arc<dyn EventSubscriber>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscriber` for `event_type`. Subscribers for the same type
    /// are called in registration order.
    pub fn subscribe(&mut self, event_type: &'static str, subscriber: Arc<dyn EventSubscriber>) {
        self.routes.entry(event_type).or_default().push(subscriber);
    }

    /// Builder-style variant of [`subscribe`](Self::subscribe).
    pub fn with_subscriber(
        mut self,
        event_type: &'static str,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Self {
        self.subscribe(event_type, subscriber);
        self
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.routes.get(event_type).map_or(0, Vec::len)
    }

    /// Delivers every event to its subscribers.
    ///
    /// A failing subscriber is recorded and skipped; it never stops delivery
    /// of the remaining subscribers or events.
    pub async fn dispatch(&self, events: &[PendingEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for event in events {
            let Some(subscribers) = self.routes.get(event.event_type) else {
                tracing::trace!(event_type = event.event_type, "no local subscribers");
                continue;
            };

            for subscriber in subscribers {
                match subscriber.handle(event).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => report.failures.push(DispatchFailure {
                        event_id: event.event_id,
                        event_type: event.event_type,
                        subscriber: subscriber.name(),
                        error: e.to_string(),
                    }),
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(event_type, subs)| (*event_type, subs.iter().map(|s| s.name()).collect::<Vec<_>>()))
            .collect();
        routes.sort();
        f.debug_struct("EventDispatcher")
            .field("routes", &routes)
            .finish()
    }
}
