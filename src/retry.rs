//! Retry configuration: handler requeue limits and connection backoff.

use crate::error::WorkerError;
use crate::message::Message;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// How many times a failing message is requeued before it is treated as poison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Failure history untouched for this long is forgotten. A requeued message
    /// that another consumer picks up never comes back here to clear its entry.
    pub failure_ttl: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failure_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_failure_ttl(mut self, failure_ttl: Duration) -> Self {
        self.failure_ttl = failure_ttl;
        self
    }

    /// `failures` counts the failed deliveries so far, including the current one.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, jitter: true }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Never exceeds `cap`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
        let jitter_ms = if self.jitter && delay_ms > 1 {
            rand::rng().random_range(0..=delay_ms / 2)
        } else {
            0
        };
        Duration::from_millis(delay_ms.saturating_add(jitter_ms).min(cap_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Runs `op` until it succeeds or `max_attempts` have failed, sleeping between attempts.
///
/// `op` receives the 1-based attempt number. On exhaustion the last error is
/// wrapped in `WorkerError::Connection`.
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: &Backoff,
    max_attempts: u32,
    mut op: F,
) -> Result<T, WorkerError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(WorkerError::Connection {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                log::warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Identity used to count redeliveries of the same message.
///
/// A requeued message comes back under a new delivery tag, so attempts are
/// keyed by the AMQP `message_id` when the publisher set one, or by a hash of
/// the body otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetryKey {
    MessageId(String),
    PayloadHash(u64),
}

impl RetryKey {
    pub fn for_message(message: &Message) -> Self {
        match &message.message_id {
            Some(id) => RetryKey::MessageId(id.clone()),
            None => {
                let mut hasher = DefaultHasher::new();
                message.payload.hash(&mut hasher);
                RetryKey::PayloadHash(hasher.finish())
            }
        }
    }
}

/// Failure history of one message across redeliveries.
#[derive(Debug, Clone)]
pub struct MessageRetryInfo {
    pub retry_count: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_retry_time: DateTime<Utc>,
}

impl MessageRetryInfo {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            retry_count: 0,
            first_failure_time: now,
            last_retry_time: now,
        }
    }

    /// Increments the retry count and records the time.
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.last_retry_time = Utc::now();
    }

    /// True once nothing has touched this entry for `ttl`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.last_retry_time)
            .to_std()
            .is_ok_and(|age| age >= ttl)
    }
}

impl Default for MessageRetryInfo {
    fn default() -> Self {
        Self::new()
    }
}
