//! Retry decisions with full-jitter exponential backoff

use std::time::Duration;

use rand::Rng;

use super::error::StorageError;
use crate::config::ClientConfig;

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again
    RetryAfter(Duration),
    /// Stop and surface this error
    GiveUp(StorageError),
}

/// Decides whether a failed attempt is retried and how long to wait.
///
/// Only transient kinds (throttling, 5xx, network failures) are retried, at
/// most `max_retries` times. The delay ceiling for attempt `n` (1-based) is
/// `min(base * 2^(n-1), max_delay)` and the actual delay is drawn uniformly
/// from `[0, ceiling]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: crate::config::DEFAULT_RETRY_BASE_DELAY,
            max_delay: crate::config::DEFAULT_RETRY_MAX_DELAY,
            max_elapsed: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.max_retries())
            .with_delays(config.retry_base_delay(), config.retry_max_delay())
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    /// Give up once this much time has passed since the first attempt
    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upper bound of the delay after the given (1-based) attempt
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decide what follows failed attempt number `attempt` (1-based).
    ///
    /// `elapsed` is the time spent since the first attempt started.
    pub fn decide(&self, attempt: u32, error: StorageError, elapsed: Duration) -> RetryDecision {
        if !error.kind().is_transient() || attempt > self.max_retries {
            return RetryDecision::GiveUp(error);
        }
        if self.max_elapsed.is_some_and(|budget| elapsed >= budget) {
            return RetryDecision::GiveUp(error);
        }

        let ceiling = self.backoff_ceiling(attempt);
        let jittered = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        RetryDecision::RetryAfter(Duration::from_millis(jittered))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}
