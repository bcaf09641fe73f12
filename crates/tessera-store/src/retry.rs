//! Bounded retry for transactions that lose an optimistic conflict.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Errors that can report a retryable transaction conflict.
pub trait Retryable {
    fn is_conflict(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

/// How often, and how patiently, to retry a conflicting transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based): exponential with up to
    /// 50% random jitter, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_backoff);
        let jitter_ms = (exp.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (exp + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// policy's attempts are exhausted. Each attempt must open its own
/// transaction. The attempt number (0-based) is passed to `op`.
///
/// When attempts run out, the last conflict error is returned to the caller.
pub async fn retry_on_conflict<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= attempts {
                    warn!(attempts, error = %e, "transaction conflict, retries exhausted");
                    return Err(e);
                }
                let delay = policy.backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "transaction conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Like [`retry_on_conflict`], for operations that are themselves async.
pub async fn retry_on_conflict_async<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Err(e) if e.is_conflict() => {
                attempt += 1;
                if attempt >= attempts {
                    warn!(attempts, error = %e, "transaction conflict, retries exhausted");
                    return Err(e);
                }
                let delay = policy.backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "transaction conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
