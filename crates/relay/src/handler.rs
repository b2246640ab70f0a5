//! Inbox handlers and the startup-built registry that routes to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use message_store::InboxRecord;

use crate::error::{HandlerError, RelayError, Result};

/// Applies inbound messages of the event types it declares.
///
/// Delivery is at-least-once, so `handle` may see the same `event_id` more
/// than once and must be safe to repeat (upsert by business key, treat a
/// missing row on delete as success).
#[async_trait]
pub trait InboxHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event types this handler consumes.
    fn supported_event_types(&self) -> &[&'static str];

    async fn handle(&self, record: &InboxRecord) -> std::result::Result<(), HandlerError>;
}

/// Event-type to handler table.
///
/// Built once at startup; the first handler registered for a type keeps it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn InboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every declared event type not yet claimed.
    /// Returns how many types it claimed.
    pub fn register(&mut self, handler: Arc<dyn InboxHandler>) -> usize {
        let mut claimed = 0;
        for event_type in handler.supported_event_types() {
            match self.handlers.get(*event_type) {
                Some(existing) => {
                    tracing::warn!(
                        event_type,
                        handler = handler.name(),
                        existing = existing.name(),
                        "event type already has a handler"
                    );
                }
                None => {
                    self.handlers
                        .insert((*event_type).to_string(), Arc::clone(&handler));
                    claimed += 1;
                }
            }
        }
        claimed
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_handler(mut self, handler: Arc<dyn InboxHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn InboxHandler>> {
        self.handlers.get(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Routes `record` to its handler.
    ///
    /// Returns [`RelayError::Dispatch`] when no handler claims the event type
    /// and [`RelayError::Handler`] when the handler fails.
    pub async fn dispatch(&self, record: &InboxRecord) -> Result<()> {
        let handler = self
            .get(&record.event_type)
            .ok_or_else(|| RelayError::Dispatch(record.event_type.clone()))?;
        handler.handle(record).await?;
        Ok(())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
