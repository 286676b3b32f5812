//! Retry policies.
//!
//! A policy only answers how long to wait before the next attempt. How many
//! attempts a job gets is decided by the job's own `max_attempts`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether and when a failed job may run again.
///
/// Implementations must be deterministic and free of side effects: both
/// methods are pure functions of `attempt` and the policy's parameters.
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    /// Whether another attempt is allowed after the zero-based `attempt`.
    fn should_retry(&self, attempt: u32) -> bool;

    /// How long to wait before running `attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration;
}

/// Retry after the same delay every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Create the policy already wrapped for sharing between jobs.
    pub fn shared(delay: Duration) -> Arc<dyn RetryPolicy> {
        Arc::new(Self::new(delay))
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, _attempt: u32) -> bool {
        true
    }

    fn backoff_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Retry with a delay that doubles per attempt, capped at `max_delay`.
///
/// `backoff_delay(k) = min(base * 2^k, max)`, saturating at `max` instead of
/// overflowing for large `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Create the policy already wrapped for sharing between jobs.
    pub fn shared(base_delay: Duration, max_delay: Duration) -> Arc<dyn RetryPolicy> {
        Arc::new(Self::new(base_delay, max_delay))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, _attempt: u32) -> bool {
        true
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32) -> bool {
        false
    }

    fn backoff_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}
