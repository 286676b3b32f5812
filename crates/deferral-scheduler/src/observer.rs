//! Job outcome observers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::job::Job;

/// Receives job outcomes from the executor.
///
/// Callbacks run on the worker thread that executed the job, in
/// registration order. A panicking observer is logged and skipped.
pub trait JobObserver: Send + Sync {
    fn on_job_success(&self, job: &Job);

    /// Called after every failed execution, before the retry decision.
    /// `attempt` is the job's attempt counter at the time of failure.
    fn on_job_failed(&self, job: &Job, attempt: u32);
}

/// Observer that writes one log line per outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn shared() -> Arc<dyn JobObserver> {
        Arc::new(Self)
    }
}

impl JobObserver for LogObserver {
    fn on_job_success(&self, job: &Job) {
        let age_ms = (Utc::now() - job.created_at()).num_milliseconds();
        info!(
            job_id = %job.id(),
            attempt = job.attempt(),
            age_ms,
            "job succeeded"
        );
    }

    fn on_job_failed(&self, job: &Job, attempt: u32) {
        let age_ms = (Utc::now() - job.created_at()).num_milliseconds();
        match job.last_error() {
            Some(error) => warn!(
                job_id = %job.id(),
                attempt,
                max_attempts = job.max_attempts(),
                age_ms,
                error = %error,
                "job failed"
            ),
            None => warn!(
                job_id = %job.id(),
                attempt,
                max_attempts = job.max_attempts(),
                age_ms,
                "job failed"
            ),
        }
    }
}
