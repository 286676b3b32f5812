//! Error types for the scheduler.

use thiserror::Error;

/// Boxed error returned by job tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a single job execution failed.
#[derive(Debug, Error)]
pub enum JobError {
    /// The task returned an error.
    #[error("task failed: {0}")]
    Task(#[source] BoxError),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Errors that can occur in worker pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A pool needs at least one worker thread.
    #[error("worker pool requires at least one thread")]
    NoWorkers,

    /// The pool has been shut down and accepts no more work.
    #[error("worker pool stopped")]
    Stopped,

    /// The task was dropped without running, usually because it was still
    /// queued when the pool shut down.
    #[error("task discarded without running")]
    Discarded,

    /// The task did not finish within its time limit.
    #[error("task timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// The task panicked while running.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Submitted job reference was absent.
    #[error("invalid job: no job supplied")]
    InvalidJob,

    /// `start` was called on a running scheduler.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// The scheduler has been shut down.
    #[error("scheduler stopped")]
    Stopped,

    /// The dispatcher thread could not be spawned.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
