//! Bounded in-process retry for publishing.
//!
//! Only the publisher retries in process, and only for failures the broker
//! may recover from (nacks, timeouts, dropped channels). Consumers never
//! sleep here; their retries travel through the broker's delayed-retry queues.
//!
//! ```rust
//! use outpost_runtime::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default()
//!     .with_max_attempts(5)
//!     .with_backoff(Backoff::Doubling);
//!
//! assert_eq!(policy.delay_after(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_after(2), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

/// Growth of the pause between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `base * (n + 1)` after the n-th failure: 1s, 2s, 3s
    #[default]
    Linear,
    /// `base * 2^n` after the n-th failure: 1s, 2s, 4s
    Doubling,
}

/// Attempt bound and pause schedule for one publish.
///
/// The default is three attempts with linear 1s steps, capped at 30s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls in total, including the first; zero behaves like one
    pub max_attempts: usize,
    /// Pause after the first failure
    pub base_delay: Duration,
    /// Upper bound of any single pause
    pub max_delay: Duration,
    /// How the pause grows
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Set the attempt bound.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first pause.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the pause cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pause after failure number `failures` (zero-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_after(&self, failures: usize) -> Duration {
        let factor = match self.backoff {
            Backoff::Linear => u32::try_from(failures.saturating_add(1)).unwrap_or(u32::MAX),
            Backoff::Doubling => u32::try_from(failures)
                .ok()
                .and_then(|n| 2_u32.checked_pow(n))
                .unwrap_or(u32::MAX),
        };
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Call `operation` until it succeeds, fails with an error `retryable`
/// rejects, or the policy runs out of attempts.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt.
pub async fn retry_while<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut failures = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(attempt = failures + 1, "Publish succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        if !retryable(&err) {
            tracing::warn!(error = %err, "Publish failure is not retryable");
            return Err(err);
        }
        failures += 1;
        if failures >= attempts {
            tracing::error!(attempts = failures, error = %err, "Publish attempts exhausted");
            return Err(err);
        }

        let delay = policy.delay_after(failures - 1);
        tracing::warn!(
            attempt = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Publish failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
