//! Scheduler and dispatch loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::executor::{Executor, ExecutorStats};
use crate::job::Job;
use crate::observer::JobObserver;
use crate::pool::WorkerPool;
use crate::queue::{QueueStats, ReadyQueue};

/// Lifecycle of a [`Scheduler`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Created,
    Running,
    Stopped,
}

/// Point-in-time view of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub state: SchedulerState,
    pub queue: QueueStats,
    pub executor: ExecutorStats,
    /// Dispatched jobs waiting for a free worker.
    pub pool_queued: usize,
}

/// Runs submitted jobs at or after their scheduled time on a worker pool.
///
/// Jobs may be submitted before or after [`start`](Self::start). After
/// [`shutdown`](Self::shutdown) begins, the dispatcher keeps going until
/// every accepted job has been resolved, then the pool is stopped.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<ReadyQueue>,
    pool: Arc<WorkerPool>,
    executor: Arc<Executor>,
    running: Arc<AtomicBool>,
    state: RwLock<SchedulerState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler and its worker pool. No job runs until
    /// [`start`](Self::start).
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let queue = Arc::new(ReadyQueue::new());
        let pool = Arc::new(WorkerPool::with_name(
            &config.thread_name,
            config.workers,
            config.queue_capacity,
        )?);
        let executor = Arc::new(Executor::with_retry_delivery(
            Arc::clone(&queue),
            config.retry_delivery,
        ));

        Ok(Self {
            config,
            queue,
            pool,
            executor,
            running: Arc::new(AtomicBool::new(false)),
            state: RwLock::new(SchedulerState::Created),
            dispatcher: Mutex::new(None),
        })
    }

    /// Create a scheduler with `workers` threads and default settings.
    pub fn with_workers(workers: usize) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default().with_workers(workers))
    }

    /// Submit a job, logging instead of failing on rejection.
    ///
    /// `None` and submissions after shutdown are logged and dropped.
    pub fn submit(&self, job: impl Into<Option<Job>>) {
        if let Err(e) = self.try_submit(job) {
            warn!(error = %e, "job submission rejected");
        }
    }

    /// Submit a job, reporting why it was rejected.
    pub fn try_submit(&self, job: impl Into<Option<Job>>) -> Result<(), SchedulerError> {
        let Some(job) = job.into() else {
            return Err(SchedulerError::InvalidJob);
        };

        // Held across the enqueue so shutdown either sees this job as
        // pending or rejects it.
        let state = self.state.read();
        if *state == SchedulerState::Stopped {
            return Err(SchedulerError::Stopped);
        }

        debug!(job_id = %job.id(), max_attempts = job.max_attempts(), "job submitted");
        self.queue.increment_pending();
        self.queue.enqueue(job);
        Ok(())
    }

    /// Spawn the dispatcher thread.
    pub fn start(&self) -> Result<(), SchedulerError> {
        // Lock order: dispatcher, then state.
        let mut dispatcher_slot = self.dispatcher.lock();
        let mut state = self.state.write();
        match *state {
            SchedulerState::Created => {}
            SchedulerState::Running => return Err(SchedulerError::AlreadyStarted),
            SchedulerState::Stopped => return Err(SchedulerError::Stopped),
        }

        self.running.store(true, Ordering::SeqCst);
        let dispatcher = Dispatcher {
            queue: Arc::clone(&self.queue),
            pool: Arc::clone(&self.pool),
            executor: Arc::clone(&self.executor),
            running: Arc::clone(&self.running),
            idle_wait: self.config.dispatch_idle_wait,
        };

        let handle = thread::Builder::new()
            .name(format!("{}-dispatch", self.config.thread_name))
            .spawn(move || dispatcher.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SchedulerError::Spawn(e)
            })?;

        *dispatcher_slot = Some(handle);
        *state = SchedulerState::Running;
        info!(
            workers = self.pool.threads(),
            queue_capacity = ?self.pool.capacity(),
            retry_delivery = ?self.config.retry_delivery,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching, wait for accepted jobs to resolve, and shut down
    /// the worker pool. Safe to call more than once.
    ///
    /// Concurrent callers block until the first shutdown has finished.
    ///
    /// Must not be called from inside a job or an observer: the dispatcher
    /// waits for active jobs, including the caller's own.
    pub fn shutdown(&self) {
        // Held for the whole shutdown so later callers wait for it.
        let mut dispatcher_slot = self.dispatcher.lock();
        let previous = std::mem::replace(&mut *self.state.write(), SchedulerState::Stopped);
        if previous == SchedulerState::Stopped {
            return;
        }

        info!(pending = self.queue.pending(), "scheduler shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.queue.wake_all();

        if let Some(handle) = dispatcher_slot.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
        self.pool.shutdown();

        let stats = self.executor.stats();
        info!(
            succeeded = stats.succeeded,
            failed_attempts = stats.failed_attempts,
            retried = stats.retried,
            abandoned = stats.abandoned,
            "scheduler shut down"
        );
    }

    /// Block until the scheduler has been idle for the configured number of
    /// consecutive polls.
    ///
    /// Never returns if a job stays pending, for example because the
    /// scheduler was never started.
    pub fn wait_for_idle(&self) {
        self.wait_idle_until(None);
    }

    /// Like [`wait_for_idle`](Self::wait_for_idle), giving up after `limit`.
    /// Returns whether idle was reached.
    pub fn wait_for_idle_timeout(&self, limit: Duration) -> bool {
        self.wait_idle_until(Some(Instant::now() + limit))
    }

    fn wait_idle_until(&self, deadline: Option<Instant>) -> bool {
        let mut stable = 0;
        loop {
            if self.is_idle() {
                stable += 1;
                if stable >= self.config.idle_stable_polls {
                    return true;
                }
            } else {
                stable = 0;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(self.config.idle_poll_interval);
        }
    }

    /// No queued jobs, no pending count, no active executions.
    pub fn is_idle(&self) -> bool {
        let queue = self.queue.stats();
        queue.queued == 0 && queue.pending == 0 && self.executor.active_jobs() == 0
    }

    /// Add an observer to the executor.
    pub fn register_observer(&self, observer: Arc<dyn JobObserver>) {
        self.executor.register_observer(observer);
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            state: self.state(),
            queue: self.queue.stats(),
            executor: self.executor.stats(),
            pool_queued: self.pool.queued(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State moved onto the dispatcher thread.
struct Dispatcher {
    queue: Arc<ReadyQueue>,
    pool: Arc<WorkerPool>,
    executor: Arc<Executor>,
    running: Arc<AtomicBool>,
    idle_wait: Duration,
}

impl Dispatcher {
    /// Keep going while running, and after shutdown until every accepted
    /// job is resolved.
    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            || !self.queue.is_empty()
            || self.queue.pending() > 0
            || self.executor.active_jobs() > 0
    }

    fn run(self) {
        debug!("dispatcher started");

        while self.should_continue() {
            let Some(job) = self.queue.dequeue_ready_timeout(self.idle_wait) else {
                continue;
            };

            debug!(job_id = %job.id(), attempt = job.attempt(), "dispatching job");
            let executor = Arc::clone(&self.executor);
            if let Err(e) = self.pool.submit(move || executor.run(job)) {
                // The job was dropped with the rejected task.
                self.queue.decrement_pending();
                error!(error = %e, "worker pool rejected dispatched job");
            }
        }

        debug!("dispatcher exited");
    }
}
