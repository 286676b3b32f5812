//! Concurrent retrying job scheduler for Deferral.
//!
//! This crate provides an in-process scheduler that:
//! - Runs each job at or after its scheduled time
//! - Executes jobs on a fixed pool of worker threads with optional backpressure
//! - Retries failed jobs according to a pluggable [`RetryPolicy`]
//! - Reports outcomes to registered [`JobObserver`]s
//!
//! ```no_run
//! use std::time::Duration;
//! use deferral_scheduler::{FixedDelay, Job, LogObserver, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default().with_workers(2))?;
//! scheduler.register_observer(LogObserver::shared());
//! scheduler.submit(
//!     Job::new("hello", || Ok::<_, std::io::Error>(()))
//!         .with_retry_policy(FixedDelay::shared(Duration::from_millis(50)))
//!         .with_delay(Duration::from_millis(10)),
//! );
//! scheduler.start()?;
//! scheduler.wait_for_idle();
//! scheduler.shutdown();
//! # Ok::<(), deferral_scheduler::SchedulerError>(())
//! ```

mod config;
mod error;
mod executor;
mod job;
mod observer;
mod pool;
mod queue;
mod retry;
mod scheduler;

pub use config::{RetryDelivery, SchedulerConfig};
pub use error::{BoxError, JobError, PoolError, SchedulerError};
pub use executor::{Executor, ExecutorStats};
pub use job::Job;
pub use observer::{JobObserver, LogObserver};
pub use pool::{TaskHandle, WorkerPool};
pub use queue::{QueueStats, ReadyQueue};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats};
