//! Job type.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::{BoxError, JobError, panic_message};
use crate::retry::RetryPolicy;

/// Default attempt budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Deadline offset used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

type Task = Box<dyn FnMut() -> Result<(), BoxError> + Send>;

/// A unit of work with its scheduling and retry state.
///
/// A job is owned by exactly one place at a time: the caller, the ready
/// queue, or the worker executing it. All mutators take `&mut self`.
pub struct Job {
    id: String,
    task: Task,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    max_attempts: u32,
    attempt: u32,
    scheduled_time: Instant,
    created_at: DateTime<Utc>,
    last_error: Option<JobError>,
}

impl Job {
    /// Create a job that is due immediately, with no retry policy.
    pub fn new<F, E>(id: impl Into<String>, mut task: F) -> Self
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            id: id.into(),
            task: Box::new(move || task().map_err(Into::into)),
            retry_policy: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt: 0,
            scheduled_time: Instant::now(),
            created_at: Utc::now(),
            last_error: None,
        }
    }

    /// Create a job with a generated UUID as its id.
    pub fn anonymous<F, E>(task: F) -> Self
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::new(uuid::Uuid::new_v4().to_string(), task)
    }

    /// Set the retry policy. Without one the job never retries.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Delay the first run by `delay` from now.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.reschedule(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn scheduled_time(&self) -> Instant {
        self.scheduled_time
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.retry_policy.as_ref()
    }

    /// The error from the most recent failed execution, if any.
    pub fn last_error(&self) -> Option<&JobError> {
        self.last_error.as_ref()
    }

    /// Check if this job's scheduled time has arrived.
    pub fn is_due(&self) -> bool {
        self.scheduled_time <= Instant::now()
    }

    /// Run the task once.
    ///
    /// Errors returned by the task and panics raised inside it are both
    /// reported as a [`JobError`].
    pub fn execute(&mut self) -> Result<(), JobError> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.task)())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobError::Task(e)),
            Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Whether the job may run again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
            && self
                .retry_policy
                .as_ref()
                .is_some_and(|policy| policy.should_retry(self.attempt))
    }

    /// Move the scheduled time to `delay` from now.
    ///
    /// Delays past the clock's range saturate to a deadline about a century
    /// away.
    pub fn reschedule(&mut self, delay: Duration) {
        let now = Instant::now();
        self.scheduled_time = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
    }

    pub fn increment_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub(crate) fn record_failure(&mut self, error: JobError) {
        self.last_error = Some(error);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("retry_policy", &self.retry_policy)
            .field("max_attempts", &self.max_attempts)
            .field("attempt", &self.attempt)
            .field("scheduled_time", &self.scheduled_time)
            .field("created_at", &self.created_at)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}
