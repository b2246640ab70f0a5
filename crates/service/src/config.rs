//! Service configuration loaded from environment variables.

use std::time::Duration;

use relay::{ProcessorConfig, PublisherConfig};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset selects the
///   in-memory store
/// - `OUTBOX_BATCH_SIZE`, `OUTBOX_MAX_RETRIES`, `OUTBOX_POLL_INTERVAL_MS`
/// - `INBOX_BATCH_SIZE`, `INBOX_IDLE_DELAY_MS`
/// - `WORKER_ERROR_DELAY_MS`: sleep after a failed poll, both workers
///
/// Unparseable numbers and zero batch sizes fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub publisher: PublisherConfig,
    pub processor: ProcessorConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str| lookup(name).and_then(|raw| raw.trim().parse::<u64>().ok());
        let batch_size = |name: &str| {
            number(name)
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
        };
        let millis = |name: &str, fallback: Duration| {
            number(name).map(Duration::from_millis).unwrap_or(fallback)
        };

        let error_delay = millis("WORKER_ERROR_DELAY_MS", defaults.publisher.error_delay);

        let publisher = PublisherConfig {
            batch_size: batch_size("OUTBOX_BATCH_SIZE").unwrap_or(defaults.publisher.batch_size),
            max_retries: number("OUTBOX_MAX_RETRIES")
                .and_then(|n| i32::try_from(n).ok())
                .unwrap_or(defaults.publisher.max_retries),
            poll_interval: millis("OUTBOX_POLL_INTERVAL_MS", defaults.publisher.poll_interval),
            error_delay,
        };

        let processor = ProcessorConfig {
            batch_size: batch_size("INBOX_BATCH_SIZE").unwrap_or(defaults.processor.batch_size),
            idle_delay: millis("INBOX_IDLE_DELAY_MS", defaults.processor.idle_delay),
            error_delay,
            ..defaults.processor
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT") {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            publisher,
            processor,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            publisher: PublisherConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}
