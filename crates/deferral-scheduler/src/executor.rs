//! Job execution with retry handling.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::RetryDelivery;
use crate::error::panic_message;
use crate::job::Job;
use crate::observer::JobObserver;
use crate::queue::ReadyQueue;

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Jobs currently inside [`Executor::run`].
    pub active: usize,
    pub succeeded: u64,
    /// Failed executions, retried or not.
    pub failed_attempts: u64,
    /// Failed executions that were re-enqueued.
    pub retried: u64,
    /// Jobs dropped after a failure with no retry left.
    pub abandoned: u64,
}

/// Runs jobs, notifies observers and resubmits failures to the ready queue.
pub struct Executor {
    queue: Arc<ReadyQueue>,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    delivery: RetryDelivery,
    active: AtomicUsize,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
}

/// Holds one slot of the active-job counter for the duration of a run.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases the pending count of the job being run.
struct PendingGuard<'a>(&'a ReadyQueue);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement_pending();
    }
}

/// Backoff before the next attempt, or `None` when the job may not retry.
///
/// Calls into the job's policy, which is user code and may panic.
fn next_retry_delay(job: &Job) -> Option<Duration> {
    if !job.should_retry() {
        return None;
    }
    let next_attempt = job.attempt().saturating_add(1);
    job.retry_policy().map(|policy| policy.backoff_delay(next_attempt))
}

impl Executor {
    /// Create an executor that waits out backoff on the worker thread.
    pub fn new(queue: Arc<ReadyQueue>) -> Self {
        Self::with_retry_delivery(queue, RetryDelivery::Blocking)
    }

    pub fn with_retry_delivery(queue: Arc<ReadyQueue>, delivery: RetryDelivery) -> Self {
        Self {
            queue,
            observers: RwLock::new(Vec::new()),
            delivery,
            active: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Add an observer. Observers are notified in registration order.
    pub fn register_observer(&self, observer: Arc<dyn JobObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            active: self.active_jobs(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Execute `job` once and resolve its outcome.
    ///
    /// Releases exactly one pending count on the ready queue: the one taken
    /// when this instance was enqueued. A retry takes a fresh count before
    /// re-enqueueing. The count is released on every exit path, unwinding
    /// included.
    pub fn run(&self, mut job: Job) {
        let _active = ActiveGuard::enter(&self.active);
        let _pending = PendingGuard(&self.queue);

        let error = match job.execute() {
            Ok(()) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.notify(|observer| observer.on_job_success(&job));
                return;
            }
            Err(e) => e,
        };

        let attempt = job.attempt();
        job.record_failure(error);
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        self.notify(|observer| observer.on_job_failed(&job, attempt));

        match panic::catch_unwind(AssertUnwindSafe(|| next_retry_delay(&job))) {
            Ok(Some(delay)) if Instant::now().checked_add(delay).is_some() => {
                self.resubmit(job, delay);
            }
            Ok(Some(delay)) => {
                warn!(
                    job_id = %job.id(),
                    attempt,
                    delay_secs = delay.as_secs(),
                    "retry delay out of range"
                );
                self.abandon(&job, attempt);
            }
            Ok(None) => self.abandon(&job, attempt),
            Err(payload) => {
                error!(
                    job_id = %job.id(),
                    attempt,
                    panic = %panic_message(payload.as_ref()),
                    "retry policy panicked"
                );
                self.abandon(&job, attempt);
            }
        }
    }

    fn abandon(&self, job: &Job, attempt: u32) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        warn!(
            job_id = %job.id(),
            attempt,
            max_attempts = job.max_attempts(),
            has_policy = job.retry_policy().is_some(),
            "job abandoned"
        );
    }

    fn resubmit(&self, mut job: Job, delay: Duration) {
        job.increment_attempt();
        job.reschedule(delay);

        debug!(
            job_id = %job.id(),
            attempt = job.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            delivery = ?self.delivery,
            "scheduling retry"
        );

        if self.delivery == RetryDelivery::Blocking && !delay.is_zero() {
            thread::sleep(delay);
        }

        self.retried.fetch_add(1, Ordering::Relaxed);
        self.queue.increment_pending();
        self.queue.enqueue(job);
    }

    fn notify(&self, call: impl Fn(&dyn JobObserver)) {
        // Snapshot so no lock is held while observer code runs.
        let observers = self.observers.read().clone();
        for observer in &observers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(observer.as_ref())));
            if let Err(payload) = outcome {
                error!(panic = %panic_message(payload.as_ref()), "job observer panicked");
            }
        }
    }
}
