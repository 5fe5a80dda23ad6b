//! Poll a condition until it holds, the deadline passes, or the wait is
//! cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::S3Client;
use super::error::{Result, StorageError};
use super::types::BucketStatus;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterConfig {
    poll_interval: Duration,
    timeout: Duration,
    max_interval: Option<Duration>,
}

impl WaiterConfig {
    /// Fixed-interval polling bounded by `timeout`; both must be non-zero
    pub fn new(poll_interval: Duration, timeout: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(StorageError::invalid("poll interval must be greater than zero"));
        }
        if timeout.is_zero() {
            return Err(StorageError::invalid("wait timeout must be greater than zero"));
        }
        Ok(Self {
            poll_interval,
            timeout,
            max_interval: None,
        })
    }

    /// Double the interval after every unsuccessful poll, up to `max_interval`
    pub fn with_backoff(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval.max(self.poll_interval));
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
            max_interval: None,
        }
    }
}

/// How a successful wait went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReport {
    /// Number of times the predicate was evaluated
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Waiter {
    config: WaiterConfig,
    cancel_token: CancellationToken,
}

impl Waiter {
    pub fn new(config: WaiterConfig) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop waiting (with [`StorageError::Cancelled`]) once `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    /// Evaluate `predicate` until it returns `true`.
    ///
    /// Fails with [`StorageError::TimedOut`] once the deadline
    /// (start + timeout) has passed, with [`StorageError::Cancelled`] when the
    /// token fires between polls, and with the predicate's own error as soon
    /// as it returns one. A predicate already running is never interrupted.
    pub async fn wait_until<F, Fut>(&self, mut predicate: F) -> Result<WaitReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut interval = self.config.poll_interval;
        let mut attempts = 0u32;

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            attempts += 1;
            if predicate().await? {
                let report = WaitReport {
                    attempts,
                    elapsed: started.elapsed(),
                };
                info!(attempts, elapsed_ms = report.elapsed.as_millis() as u64, "condition met");
                return Ok(report);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StorageError::TimedOut(self.config.timeout));
            }

            let pause = interval.min(remaining);
            debug!(attempts, pause_ms = pause.as_millis() as u64, "condition not met yet");

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => return Err(StorageError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }

            if Instant::now() >= deadline {
                return Err(StorageError::TimedOut(self.config.timeout));
            }
            if let Some(max_interval) = self.config.max_interval {
                interval = interval.saturating_mul(2).min(max_interval);
            }
        }
    }

    pub async fn wait_until_bucket_exists(&self, client: &S3Client, bucket: &str) -> Result<WaitReport> {
        self.wait_until(|| async move {
            Ok(client.head_bucket(bucket).await? == BucketStatus::Exists)
        })
        .await
    }

    pub async fn wait_until_bucket_not_exists(
        &self,
        client: &S3Client,
        bucket: &str,
    ) -> Result<WaitReport> {
        self.wait_until(|| async move {
            Ok(client.head_bucket(bucket).await? == BucketStatus::Absent)
        })
        .await
    }

    pub async fn wait_until_object_exists(
        &self,
        client: &S3Client,
        bucket: &str,
        key: &str,
    ) -> Result<WaitReport> {
        self.wait_until(|| async move {
            match client.head_object(bucket, key).await {
                Ok(_) => Ok(true),
                Err(StorageError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
