//! Fixed-size worker pool with a bounded task queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, panic_message};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    stopped: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

impl Shared {
    fn is_full(&self, state: &PoolState) -> bool {
        self.capacity.is_some_and(|cap| state.tasks.len() >= cap)
    }
}

/// Receives the return value of a task submitted to a [`WorkerPool`].
///
/// Dropping the handle does not affect the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn join(self) -> Result<T, PoolError> {
        self.rx.recv().unwrap_or(Err(PoolError::Discarded))
    }

    /// Return the result if the task has finished, `None` if it is still
    /// queued or running.
    pub fn try_join(&self) -> Option<Result<T, PoolError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PoolError::Discarded)),
        }
    }
}

/// A fixed set of worker threads pulling tasks from a FIFO queue.
///
/// With a capacity configured, [`submit`](Self::submit) blocks while the
/// queue is full. Shutdown finishes tasks already running and discards the
/// backlog.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers. A capacity of `None` or `Some(0)` means an
    /// unbounded queue.
    pub fn new(threads: usize, capacity: Option<usize>) -> Result<Self, PoolError> {
        Self::with_name("deferral", threads, capacity)
    }

    /// Like [`new`](Self::new), naming threads `<prefix>-worker-<n>`.
    pub fn with_name(
        prefix: &str,
        threads: usize,
        capacity: Option<usize>,
    ) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.filter(|&cap| cap > 0),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{prefix}-worker-{index}"))
                .spawn(move || worker_loop(&worker_shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Keep what we have rather than failing the whole pool.
                    error!(index, error = %e, "failed to spawn worker thread");
                }
            }
        }

        if workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        info!(
            threads = workers.len(),
            capacity = ?shared.capacity,
            "worker pool started"
        );

        Ok(Self {
            threads: workers.len(),
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue `f` to run on a worker.
    ///
    /// Blocks while a bounded queue is full. Returns
    /// [`PoolError::Stopped`] once shutdown has begun, including when
    /// shutdown starts while this call is blocked.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let task: Task = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(Ok(value));
            }
            Err(payload) => {
                let _ = tx.send(Err(PoolError::TaskPanicked(panic_message(payload.as_ref()))));
                panic::resume_unwind(payload);
            }
        });

        self.push(task)?;
        Ok(TaskHandle { rx })
    }

    /// Queue `f` to run on a worker with a time limit.
    ///
    /// The worker starts `f` on a helper thread and waits at most `timeout`
    /// for it. On expiry the handle reports [`PoolError::TimedOut`] and the
    /// worker moves on to the next task; the helper thread is detached and
    /// `f` runs to completion in the background. A zero timeout behaves like
    /// [`submit`](Self::submit).
    pub fn submit_with_timeout<F, T>(
        &self,
        f: F,
        timeout: Duration,
    ) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if timeout.is_zero() {
            return self.submit(f);
        }

        let (tx, rx) = channel::bounded(1);
        let task: Task = Box::new(move || {
            let _ = tx.send(run_with_timeout(f, timeout));
        });

        self.push(task)?;
        Ok(TaskHandle { rx })
    }

    /// Append a task, blocking while a bounded queue is full.
    fn push(&self, task: Task) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state.lock();
            while !state.stopped && self.shared.is_full(&state) {
                debug!(queued = state.tasks.len(), "worker queue full, waiting");
                self.shared.not_full.wait(&mut state);
            }
            if state.stopped {
                return Err(PoolError::Stopped);
            }
            state.tasks.push_back(task);
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Stop accepting work, discard queued tasks, and join every worker after
    /// its current task. Safe to call more than once.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.tasks)
        };
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        if !discarded.is_empty() {
            warn!(count = discarded.len(), "discarding queued tasks at shutdown");
        }
        // Dropping the tasks closes their result channels.
        drop(discarded);

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                // Shutdown requested from inside a task; the worker exits on
                // its own once the task returns.
                continue;
            }
            if worker.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
        info!("worker pool shut down");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queue bound, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_with_timeout<F, T>(f: F, timeout: Duration) -> Result<T, PoolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = channel::bounded(1);
    let spawned = thread::Builder::new().spawn(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| PoolError::TaskPanicked(panic_message(payload.as_ref())));
        let _ = tx.send(outcome);
    });
    if let Err(e) = spawned {
        error!(error = %e, "failed to spawn thread for timed task");
        return Err(PoolError::Discarded);
    }

    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "task timed out"
            );
            Err(PoolError::TimedOut(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(PoolError::Discarded),
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            while !state.stopped && state.tasks.is_empty() {
                shared.not_empty.wait(&mut state);
            }
            if state.stopped {
                debug!(index, "worker exiting");
                return;
            }
            match state.tasks.pop_front() {
                Some(task) => task,
                None => continue,
            }
        };
        shared.not_full.notify_one();

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                index,
                panic = %panic_message(payload.as_ref()),
                "task panicked"
            );
        }
    }
}
