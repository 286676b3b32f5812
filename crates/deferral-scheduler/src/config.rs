//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// How a failed job waits out its backoff before running again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDelivery {
    /// Sleep on the worker thread, then re-enqueue. The worker is unavailable
    /// for the whole backoff window.
    #[default]
    Blocking,
    /// Re-enqueue immediately with a future scheduled time and let the ready
    /// queue hold the job until it is due.
    Deferred,
}

/// Construction-time settings for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads in the pool.
    pub workers: usize,
    /// Bound on the worker pool's task queue; `None` or `0` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Interval between idle checks in `wait_for_idle`.
    pub idle_poll_interval: Duration,
    /// Consecutive idle checks required before `wait_for_idle` returns.
    pub idle_stable_polls: u32,
    /// How long the dispatcher waits on an empty queue before re-checking
    /// for shutdown.
    pub dispatch_idle_wait: Duration,
    pub retry_delivery: RetryDelivery,
    /// Prefix for dispatcher and worker thread names.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: None,
            idle_poll_interval: Duration::from_millis(50),
            idle_stable_polls: 5,
            dispatch_idle_wait: Duration::from_millis(100),
            retry_delivery: RetryDelivery::Blocking,
            thread_name: "deferral".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_idle_poll(mut self, interval: Duration, stable_polls: u32) -> Self {
        self.idle_poll_interval = interval;
        self.idle_stable_polls = stable_polls;
        self
    }

    pub fn with_dispatch_idle_wait(mut self, wait: Duration) -> Self {
        self.dispatch_idle_wait = wait;
        self
    }

    pub fn with_retry_delivery(mut self, delivery: RetryDelivery) -> Self {
        self.retry_delivery = delivery;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Check the configuration for values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.idle_stable_polls == 0 {
            return Err(SchedulerError::InvalidConfig(
                "idle_stable_polls must be at least 1".to_string(),
            ));
        }
        if self.idle_poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "idle_poll_interval must be non-zero".to_string(),
            ));
        }
        if self.dispatch_idle_wait.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "dispatch_idle_wait must be non-zero".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
