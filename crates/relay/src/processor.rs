//! Background worker applying inbox rows through the handler registry.

use std::sync::Arc;
use std::time::Duration;

use common::{SharedClock, SystemClock};
use message_store::{InboxRecord, InboxStore};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::error::{RelayError, Result};
use crate::handler::HandlerRegistry;

/// Inbox processor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    /// Pause after a poll that found less than a full batch.
    pub idle_delay: Duration,
    /// Pause after a storage failure.
    pub error_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            idle_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub fetched: usize,
    pub handled: usize,
    /// Rows whose handler failed; rescheduled with backoff.
    pub failed: usize,
    /// Rows with no registered handler; rescheduled on the fixed delay.
    pub unhandled: usize,
}

/// Polls due inbox rows and hands each to the handler registered for its
/// event type.
pub struct InboxProcessor<S: InboxStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    clock: SharedClock,
    config: ProcessorConfig,
}

impl<S: InboxStore> InboxProcessor<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: ProcessorConfig) -> Self {
        Self::with_clock(store, registry, config, SystemClock::shared())
    }

    pub fn with_clock(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Runs one poll cycle. Each row is written back as soon as it has been
    /// handled.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<ProcessReport> {
        let batch = self
            .store
            .get_pending(self.config.batch_size, self.clock.now())
            .await?;
        let mut report = ProcessReport {
            fetched: batch.len(),
            ..ProcessReport::default()
        };

        for mut record in batch {
            if cancel.is_cancelled() {
                break;
            }
            self.process(&mut record, &mut report).await;
            self.store.update_inbox(&record).await?;
        }

        if report.fetched > 0 {
            tracing::info!(
                fetched = report.fetched,
                handled = report.handled,
                failed = report.failed,
                unhandled = report.unhandled,
                "inbox batch processed"
            );
        }
        Ok(report)
    }

    async fn process(&self, record: &mut InboxRecord, report: &mut ProcessReport) {
        let outcome = self.registry.dispatch(record).await;
        let now = self.clock.now();

        match outcome {
            Ok(()) => {
                record.retry.complete(now);
                report.handled += 1;
                metrics::counter!("inbox_handled_total").increment(1);
                tracing::debug!(
                    message_id = %record.id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    tombstone = record.is_tombstone,
                    "inbox message handled"
                );
            }
            Err(RelayError::Dispatch(event_type)) => {
                let next = self.config.retry.next_unhandled_attempt(now);
                record.retry.fail(format!("NoHandler:{event_type}"), next);
                report.unhandled += 1;
                metrics::counter!("inbox_unhandled_total").increment(1);
                tracing::warn!(
                    message_id = %record.id,
                    event_type = %event_type,
                    retry_count = record.retry.retry_count,
                    "no handler registered for inbox message"
                );
            }
            Err(e) => {
                let next = self
                    .config
                    .retry
                    .next_attempt(now, record.retry.retry_count);
                let error = match e {
                    RelayError::Handler(inner) => inner.to_string(),
                    other => other.to_string(),
                };
                record.retry.fail(error, next);
                report.failed += 1;
                metrics::counter!("inbox_failures_total").increment(1);
                tracing::warn!(
                    message_id = %record.id,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    retry_count = record.retry.retry_count,
                    next_attempt_at = %record.retry.next_attempt_at,
                    error = record.retry.last_error.as_deref().unwrap_or_default(),
                    "inbox handler failed"
                );
            }
        }
    }

    /// Polls until `cancel` fires. Sleeps `idle_delay` after a short or empty
    /// batch and `error_delay` after a failed cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            handlers = self.registry.len(),
            "inbox processor started"
        );

        while !cancel.is_cancelled() {
            let delay = match self.run_once(&cancel).await {
                Ok(report) if report.fetched > 0 && report.fetched >= self.config.batch_size => {
                    None
                }
                Ok(_) => Some(self.config.idle_delay),
                Err(e) => {
                    tracing::error!(error = %e, "inbox processing cycle failed");
                    Some(self.config.error_delay)
                }
            };

            let Some(delay) = delay else {
                continue;
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("inbox processor stopped");
    }
}
