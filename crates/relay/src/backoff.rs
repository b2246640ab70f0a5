//! Retry scheduling for inbox rows.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Exponential backoff with a capped doubling exponent.
///
/// `delay(n) = base_delay * 2^min(n, max_exponent)`. Rows whose event type has
/// no registered handler wait the fixed `no_handler_delay` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_exponent: u32,
    pub no_handler_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_exponent: 6,
            no_handler_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `retry_count` failures.
    pub fn delay(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0))
            .unwrap_or(0)
            .min(self.max_exponent);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// The longest delay the policy can produce for a handler failure.
    pub fn max_delay(&self) -> Duration {
        self.delay(i32::MAX)
    }

    /// When a row that has failed `retry_count` times may be attempted again.
    pub fn next_attempt(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        after(now, self.delay(retry_count))
    }

    /// When a row with no matching handler may be attempted again.
    pub fn next_unhandled_attempt(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, self.no_handler_delay)
    }
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
