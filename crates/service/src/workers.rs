//! Background worker lifecycle.

use std::sync::Arc;

use message_store::{InboxStore, OutboxStore};
use relay::{
    HandlerRegistry, InboxProcessor, MessageBroker, OutboxPublisher, ProcessorConfig,
    PublisherConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The outbox publisher and inbox processor running as spawned tasks that
/// share one cancellation token.
pub struct Workers {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Spawns one publisher loop and one processor loop over `store`.
    pub fn spawn<S, B>(
        store: Arc<S>,
        broker: Arc<B>,
        registry: Arc<HandlerRegistry>,
        publisher: PublisherConfig,
        processor: ProcessorConfig,
    ) -> Self
    where
        S: OutboxStore + InboxStore + 'static,
        B: MessageBroker + 'static,
    {
        let cancel = CancellationToken::new();
        if registry.is_empty() {
            tracing::warn!("no inbox handlers registered, inbox rows will back off as unhandled");
        }

        let publisher = OutboxPublisher::new(store.clone(), broker, publisher);
        let publisher_cancel = cancel.clone();
        let publisher = tokio::spawn(async move { publisher.run(publisher_cancel).await });

        let processor = InboxProcessor::new(store, registry, processor);
        let processor_cancel = cancel.clone();
        let processor = tokio::spawn(async move { processor.run(processor_cancel).await });

        tracing::info!("relay workers started");
        Self {
            cancel,
            handles: vec![("outbox_publisher", publisher), ("inbox_processor", processor)],
        }
    }

    /// Token observed by every worker; cancelling it stops them.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the workers and waits for their current row to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(worker = name, error = %e, "worker task failed");
            }
        }
        tracing::info!("relay workers stopped");
    }
}
