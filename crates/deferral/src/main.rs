//! Deferral: delayed job runner
//!
//! Main binary with subcommands:
//! - `demo`: Run a few jobs that succeed, fail, and retry
//! - `bench`: Push many no-op jobs through the scheduler and report throughput

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use deferral_scheduler::{
    BoxError, ExponentialBackoff, FixedDelay, Job, LogObserver, Scheduler, SchedulerConfig,
    SchedulerStats,
};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "deferral")]
#[command(about = "Run delayed jobs with retries on a worker pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run three sample jobs with retry policies and log their outcomes
    Demo {
        /// Worker threads (defaults to the number of CPUs)
        #[arg(long, env = "DEFERRAL_WORKERS")]
        workers: Option<usize>,
    },

    /// Submit many no-op jobs and measure how fast they drain
    Bench {
        /// Number of jobs to submit
        #[arg(long, default_value = "10000")]
        jobs: usize,

        /// Worker threads (defaults to the number of CPUs)
        #[arg(long, env = "DEFERRAL_WORKERS")]
        workers: Option<usize>,

        /// Bound on tasks waiting for a worker (0 means unbounded)
        #[arg(long, env = "DEFERRAL_QUEUE_CAPACITY")]
        capacity: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "deferral=info,deferral_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { workers } => run_demo(workers),
        Commands::Bench {
            jobs,
            workers,
            capacity,
            json,
        } => run_bench(jobs, workers, capacity, json),
    }
}

fn build_config(workers: Option<usize>, capacity: Option<usize>) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    if let Some(workers) = workers {
        config = config.with_workers(workers);
    }
    if let Some(capacity) = capacity {
        config = config.with_queue_capacity(capacity);
    }
    config
}

/// A task that fails `failures` times and then succeeds.
fn fail_times(name: &'static str, failures: u32) -> impl FnMut() -> Result<(), BoxError> + Send {
    let calls = AtomicU32::new(0);
    move || {
        let call = calls.fetch_add(1, Ordering::Relaxed);
        if call < failures {
            Err(format!("{name}: simulated failure {}", call + 1).into())
        } else {
            Ok(())
        }
    }
}

fn run_demo(workers: Option<usize>) -> Result<()> {
    let scheduler = Scheduler::new(build_config(workers, None)).into_diagnostic()?;
    scheduler.register_observer(LogObserver::shared());
    scheduler.start().into_diagnostic()?;

    scheduler.submit(Job::new("hello", || {
        info!("hello from a scheduled job");
        Ok::<_, BoxError>(())
    }));

    scheduler.submit(
        Job::new("flaky", fail_times("flaky", 1))
            .with_retry_policy(FixedDelay::shared(Duration::from_secs(1)))
            .with_delay(Duration::from_millis(200)),
    );

    scheduler.submit(
        Job::new("stubborn", fail_times("stubborn", 3))
            .with_retry_policy(ExponentialBackoff::shared(
                Duration::from_millis(100),
                Duration::from_secs(1),
            ))
            .with_max_attempts(3),
    );

    scheduler.wait_for_idle();
    scheduler.shutdown();

    let stats = scheduler.stats();
    info!(
        succeeded = stats.executor.succeeded,
        failed_attempts = stats.executor.failed_attempts,
        abandoned = stats.executor.abandoned,
        "demo finished"
    );
    Ok(())
}

/// Throughput report printed by `bench`.
#[derive(Debug, Serialize)]
struct BenchReport {
    jobs: usize,
    workers: usize,
    queue_capacity: Option<usize>,
    elapsed_ms: u128,
    jobs_per_sec: f64,
    stats: SchedulerStats,
}

fn run_bench(
    jobs: usize,
    workers: Option<usize>,
    capacity: Option<usize>,
    json: bool,
) -> Result<()> {
    let scheduler = Scheduler::new(build_config(workers, capacity)).into_diagnostic()?;
    let config = scheduler.config().clone();

    for _ in 0..jobs {
        scheduler
            .try_submit(Job::anonymous(|| Ok::<_, BoxError>(())))
            .into_diagnostic()?;
    }

    let started = Instant::now();
    scheduler.start().into_diagnostic()?;
    scheduler.wait_for_idle();
    let elapsed = started.elapsed();
    scheduler.shutdown();

    let report = BenchReport {
        jobs,
        workers: config.workers,
        queue_capacity: config.queue_capacity,
        elapsed_ms: elapsed.as_millis(),
        jobs_per_sec: throughput(jobs, elapsed),
        stats: scheduler.stats(),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).into_diagnostic()?;
        println!("{out}");
    } else {
        println!(
            "{} jobs on {} workers in {} ms ({:.0} jobs/s)",
            report.jobs, report.workers, report.elapsed_ms, report.jobs_per_sec
        );
        println!(
            "succeeded: {}, failed attempts: {}, abandoned: {}",
            report.stats.executor.succeeded,
            report.stats.executor.failed_attempts,
            report.stats.executor.abandoned
        );
    }
    Ok(())
}

fn throughput(jobs: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { jobs as f64 / secs } else { 0.0 }
}
