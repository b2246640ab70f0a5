//! Background worker moving outbox rows to the broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{SharedClock, SystemClock};
use message_store::{OutboxMessage, OutboxStore};
use tokio_util::sync::CancellationToken;

use crate::backoff::after;
use crate::broker::MessageBroker;
use crate::error::Result;

/// Outbox publisher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Maximum rows fetched per poll.
    pub batch_size: usize,
    /// Failed attempts after which a row is given up on.
    pub max_retries: i32,
    pub poll_interval: Duration,
    /// Pause after a storage failure.
    pub error_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
            poll_interval: Duration::from_secs(1),
            error_delay: Duration::from_secs(10),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub fetched: usize,
    pub published: usize,
    /// Rows that failed and stay queued.
    pub retried: usize,
    /// Rows that failed for the last time and were marked processed.
    pub poisoned: usize,
}

/// Polls unprocessed outbox rows and publishes them.
///
/// Delivery is at-least-once: a row is marked processed only after the
/// broker accepted it, so a crash between publish and write-back republishes.
pub struct OutboxPublisher<S: OutboxStore, B: MessageBroker> {
    store: Arc<S>,
    broker: Arc<B>,
    clock: SharedClock,
    config: PublisherConfig,
}

impl<S: OutboxStore, B: MessageBroker> OutboxPublisher<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>, config: PublisherConfig) -> Self {
        Self::with_clock(store, broker, config, SystemClock::shared())
    }

    pub fn with_clock(
        store: Arc<S>,
        broker: Arc<B>,
        config: PublisherConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Runs one poll cycle.
    ///
    /// Rows are attempted oldest first. Cancellation is checked before every
    /// publish call; rows not attempted are left untouched. Attempted rows are
    /// written back in one batch at the end of the pass.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<PublishReport> {
        let batch = self.store.fetch_unprocessed(self.config.batch_size).await?;
        let mut report = PublishReport {
            fetched: batch.len(),
            ..PublishReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let mut attempted = Vec::with_capacity(batch.len());
        for mut message in batch {
            if cancel.is_cancelled() {
                tracing::debug!(
                    remaining = report.fetched - attempted.len(),
                    "publish pass cancelled"
                );
                break;
            }

            self.attempt(&mut message, &mut report).await;
            attempted.push(message);
        }

        if !attempted.is_empty() {
            self.store.update_outbox(&attempted).await?;
        }

        if report.published + report.retried + report.poisoned > 0 {
            tracing::info!(
                fetched = report.fetched,
                published = report.published,
                retried = report.retried,
                poisoned = report.poisoned,
                "outbox batch processed"
            );
        }
        Ok(report)
    }

    async fn attempt(&self, message: &mut OutboxMessage, report: &mut PublishReport) {
        let delivery = message.to_delivery();
        let started = Instant::now();
        let outcome = self
            .broker
            .publish(
                &delivery.topic,
                &delivery.key,
                delivery.payload.as_deref(),
                &delivery.headers,
            )
            .await;
        metrics::histogram!("outbox_publish_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                message.retry.complete(now);
                report.published += 1;
                metrics::counter!("outbox_published_total").increment(1);
                tracing::debug!(
                    message_id = %message.id,
                    event_id = %message.event_id,
                    topic = %message.topic,
                    "outbox message published"
                );
            }
            Err(e) => {
                message
                    .retry
                    .fail(e.to_string(), after(now, self.config.poll_interval));

                if message.retry.retry_count >= self.config.max_retries {
                    message.retry.give_up(now);
                    report.poisoned += 1;
                    metrics::counter!("outbox_poisoned_total").increment(1);
                    tracing::error!(
                        message_id = %message.id,
                        event_id = %message.event_id,
                        event_type = %message.event_type,
                        topic = %message.topic,
                        retry_count = message.retry.retry_count,
                        error = %e,
                        "giving up on outbox message"
                    );
                } else {
                    report.retried += 1;
                    metrics::counter!("outbox_retries_total").increment(1);
                    tracing::warn!(
                        message_id = %message.id,
                        event_id = %message.event_id,
                        topic = %message.topic,
                        retry_count = message.retry.retry_count,
                        error = %e,
                        "outbox publish failed"
                    );
                }
            }
        }
    }

    /// Polls until `cancel` fires.
    ///
    /// A failed cycle is logged and followed by the longer error delay; the
    /// loop never exits on its own.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox publisher started"
        );

        while !cancel.is_cancelled() {
            let delay = match self.run_once(&cancel).await {
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    tracing::error!(error = %e, "outbox publish cycle failed");
                    self.config.error_delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("outbox publisher stopped");
    }
}
