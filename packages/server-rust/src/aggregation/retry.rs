//! Retry policy for optimistic lock conflicts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{trace, warn};

use super::error::AggregationError;

/// Backoff policy applied when an optimistic mutation conflicts.
///
/// Attempts are 1-based. `maximum_retries == 0` retries forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticLockRetryPolicy {
    pub maximum_retries: u32,
    pub retry_delay: Duration,
    pub maximum_retry_delay: Duration,
    pub exponential_backoff: bool,
    pub random_backoff: bool,
}

impl Default for OptimisticLockRetryPolicy {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay: Duration::from_millis(50),
            maximum_retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            random_backoff: false,
        }
    }
}

impl OptimisticLockRetryPolicy {
    /// Checks that exponential and random backoff are not both selected.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::Configuration`] on conflicting options.
    pub fn validate(&self) -> Result<(), AggregationError> {
        if self.exponential_backoff && self.random_backoff {
            return Err(AggregationError::Configuration(
                "exponential and random backoff are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether another attempt may follow the failed `attempt`.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.maximum_retries == 0 || attempt < self.maximum_retries
    }

    /// Delay to sleep after the failed `attempt`.
    ///
    /// Random backoff draws from `[0, maximum_retry_delay]` even when
    /// `retry_delay` is zero.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.maximum_retry_delay.max(self.retry_delay);
        if self.random_backoff {
            let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
            return Duration::from_millis(rand::rng().random_range(0..=max_ms));
        }
        if self.retry_delay.is_zero() {
            return Duration::ZERO;
        }
        if self.exponential_backoff {
            let factor = 1_u32
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u32::MAX);
            return self.retry_delay.saturating_mul(factor).min(ceiling);
        }
        self.retry_delay
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the
/// policy gives up.
///
/// `op` receives the 1-based attempt number and is expected to re-read the
/// current aggregate before each attempt.
///
/// # Errors
///
/// Returns the first non-conflict error from `op`, or
/// [`AggregationError::RetriesExhausted`] when the policy stops retrying.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &OptimisticLockRetryPolicy,
    mut op: F,
) -> Result<T, AggregationError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AggregationError>>,
{
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Err(AggregationError::OptimisticLockConflict { key }) => {
                if !policy.should_retry(attempt) {
                    warn!(key, attempts = attempt, "giving up after optimistic lock conflicts");
                    return Err(AggregationError::RetriesExhausted { attempts: attempt });
                }
                let delay = policy.delay(attempt);
                trace!(key, attempt, delay_ms = delay.as_millis(), "retrying after conflict");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            other => return other,
        }
    }
}
