//! End-to-end tests driving the scheduler through its public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use deferral_scheduler::{
    BoxError, ExponentialBackoff, FixedDelay, Job, JobObserver, RetryDelivery, RetryPolicy,
    Scheduler, SchedulerConfig,
};

/// Outcome recorded by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Success(String),
    Failed(String, u32),
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn successes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Success(_)))
            .count()
    }

    fn failures(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Failed(..)))
            .count()
    }
}

impl JobObserver for RecordingObserver {
    fn on_job_success(&self, job: &Job) {
        self.events.lock().push(Event::Success(job.id().to_string()));
    }

    fn on_job_failed(&self, job: &Job, attempt: u32) {
        self.events
            .lock()
            .push(Event::Failed(job.id().to_string(), attempt));
    }
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(workers)
        .with_idle_poll(Duration::from_millis(10), 5)
        .with_dispatch_idle_wait(Duration::from_millis(10))
}

fn scheduler_with_observer(config: SchedulerConfig) -> (Scheduler, Arc<RecordingObserver>) {
    let scheduler = Scheduler::new(config).unwrap();
    let observer = Arc::new(RecordingObserver::default());
    scheduler.register_observer(observer.clone());
    (scheduler, observer)
}

fn counting_job(id: &str, counter: &Arc<AtomicUsize>) -> Job {
    let counter = Arc::clone(counter);
    Job::new(id, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, BoxError>(())
    })
}

#[test]
fn successful_job_runs_once() {
    let (scheduler, observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    scheduler.submit(
        counting_job("integration-job", &counter)
            .with_retry_policy(FixedDelay::shared(Duration::from_millis(100)))
            .with_delay(Duration::from_millis(100))
            .with_max_attempts(1),
    );

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(
        observer.events(),
        vec![Event::Success("integration-job".to_string())]
    );
}

#[test]
fn job_failing_once_then_succeeding() {
    let (scheduler, observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let task_calls = Arc::clone(&calls);
    scheduler.submit(
        Job::new("flaky", move || {
            if task_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("simulated failure")
            } else {
                Ok(())
            }
        })
        .with_retry_policy(FixedDelay::shared(Duration::from_millis(50)))
        .with_max_attempts(3),
    );

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        observer.events(),
        vec![
            Event::Failed("flaky".to_string(), 0),
            Event::Success("flaky".to_string()),
        ]
    );
}

#[test]
fn failing_job_without_policy_is_never_retried() {
    let (scheduler, observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    scheduler.submit(Job::new("doomed", || Err::<(), _>("always")).with_max_attempts(5));

    scheduler.wait_for_idle();
    let stats = scheduler.stats();
    scheduler.shutdown();

    assert_eq!(observer.events(), vec![Event::Failed("doomed".to_string(), 0)]);
    assert_eq!(stats.queue.enqueued_total, 1);
    assert_eq!(stats.executor.retried, 0);
    assert_eq!(stats.executor.abandoned, 1);
}

#[test]
fn always_failing_job_exhausts_its_retry_budget() {
    const MAX_ATTEMPTS: u32 = 4;

    let (scheduler, observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    scheduler.submit(
        Job::new("hopeless", || Err::<(), _>("nope"))
            .with_retry_policy(FixedDelay::shared(Duration::from_millis(5)))
            .with_max_attempts(MAX_ATTEMPTS),
    );

    scheduler.wait_for_idle();
    let stats = scheduler.stats();
    scheduler.shutdown();

    // One submission plus exactly MAX_ATTEMPTS re-enqueues.
    assert_eq!(stats.executor.retried, u64::from(MAX_ATTEMPTS));
    assert_eq!(stats.queue.enqueued_total, u64::from(MAX_ATTEMPTS) + 1);
    assert_eq!(stats.executor.abandoned, 1);
    assert_eq!(observer.successes(), 0);

    let attempts: Vec<u32> = observer
        .events()
        .into_iter()
        .map(|event| match event {
            Event::Failed(_, attempt) => attempt,
            Event::Success(id) => panic!("unexpected success for {id}"),
        })
        .collect();
    assert_eq!(attempts, (0..=MAX_ATTEMPTS).collect::<Vec<_>>());
}

#[test]
fn exponential_backoff_spaces_out_retries() {
    let (scheduler, observer) = scheduler_with_observer(config(1));
    scheduler.start().unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let task_calls = Arc::clone(&calls);
    scheduler.submit(
        Job::new("exp", move || {
            let mut calls = task_calls.lock();
            calls.push(Instant::now());
            if calls.len() < 3 {
                Err("not yet")
            } else {
                Ok(())
            }
        })
        .with_retry_policy(ExponentialBackoff::shared(
            Duration::from_millis(20),
            Duration::from_secs(1),
        ))
        .with_max_attempts(5),
    );

    scheduler.wait_for_idle();
    scheduler.shutdown();

    let calls = calls.lock();
    assert_eq!(calls.len(), 3);
    // Post-increment attempts 1 and 2: 40ms then 80ms.
    assert!(calls[1] - calls[0] >= Duration::from_millis(35));
    assert!(calls[2] - calls[1] >= Duration::from_millis(75));
    assert_eq!(observer.failures(), 2);
    assert_eq!(observer.successes(), 1);
}

#[test]
fn unbounded_retry_delay_does_not_wedge_the_scheduler() {
    for delivery in [RetryDelivery::Blocking, RetryDelivery::Deferred] {
        let (scheduler, observer) =
            scheduler_with_observer(config(1).with_retry_delivery(delivery));
        scheduler.start().unwrap();

        scheduler.submit(
            Job::new("never-again", || Err::<(), _>("fails"))
                .with_retry_policy(FixedDelay::shared(Duration::MAX))
                .with_max_attempts(1),
        );

        assert!(scheduler.wait_for_idle_timeout(Duration::from_secs(5)));
        let stats = scheduler.stats();
        scheduler.shutdown();

        assert_eq!(observer.events(), vec![Event::Failed("never-again".to_string(), 0)]);
        assert_eq!(stats.queue.pending, 0);
        assert_eq!(stats.executor.abandoned, 1);
        assert_eq!(stats.executor.retried, 0);
    }
}

#[derive(Debug)]
struct PanickingPolicy;

impl RetryPolicy for PanickingPolicy {
    fn should_retry(&self, _attempt: u32) -> bool {
        true
    }

    fn backoff_delay(&self, _attempt: u32) -> Duration {
        panic!("policy bug")
    }
}

#[test]
fn panicking_retry_policy_does_not_wedge_the_scheduler() {
    let (scheduler, observer) = scheduler_with_observer(config(1));
    scheduler.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    scheduler.submit(
        Job::new("bad-policy", || Err::<(), _>("fails"))
            .with_retry_policy(Arc::new(PanickingPolicy)),
    );
    scheduler.submit(counting_job("after", &counter).with_delay(Duration::from_millis(20)));

    assert!(scheduler.wait_for_idle_timeout(Duration::from_secs(5)));
    scheduler.shutdown();

    // The worker survived and kept running jobs.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(observer.failures(), 1);
    assert_eq!(observer.successes(), 1);
    assert_eq!(scheduler.stats().executor.abandoned, 1);
}

#[test]
fn huge_initial_delay_is_accepted() {
    let (scheduler, _observer) = scheduler_with_observer(config(1));

    let job = Job::new("far-off", || Ok::<_, BoxError>(())).with_delay(Duration::MAX);
    assert!(!job.is_due());
    assert!(scheduler.try_submit(job).is_ok());
    assert_eq!(scheduler.stats().queue.pending, 1);
}

#[test]
fn earlier_deadline_runs_first() {
    let (scheduler, observer) = scheduler_with_observer(config(1));

    let counter = Arc::new(AtomicUsize::new(0));
    scheduler.submit(counting_job("slow", &counter).with_delay(Duration::from_millis(100)));
    scheduler.submit(counting_job("fast", &counter).with_delay(Duration::from_millis(10)));
    scheduler.start().unwrap();

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(
        observer.events(),
        vec![
            Event::Success("fast".to_string()),
            Event::Success("slow".to_string()),
        ]
    );
}

#[test]
fn job_never_runs_before_its_scheduled_time() {
    let (scheduler, _observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    let ran_at = Arc::new(Mutex::new(None));
    let task_ran_at = Arc::clone(&ran_at);
    let submitted = Instant::now();
    scheduler.submit(
        Job::new("deadline", move || {
            *task_ran_at.lock() = Some(Instant::now());
            Ok::<_, BoxError>(())
        })
        .with_delay(Duration::from_millis(80)),
    );

    scheduler.wait_for_idle();
    scheduler.shutdown();

    let ran_at = (*ran_at.lock()).expect("job ran");
    assert!(ran_at - submitted >= Duration::from_millis(75));
}

#[test]
fn none_submission_leaves_scheduler_untouched() {
    let (scheduler, observer) = scheduler_with_observer(config(2));
    scheduler.start().unwrap();

    scheduler.submit(None);

    assert!(scheduler.wait_for_idle_timeout(Duration::from_secs(5)));
    let stats = scheduler.stats();
    scheduler.shutdown();

    assert!(observer.events().is_empty());
    assert_eq!(stats.queue.pending, 0);
    assert_eq!(stats.queue.enqueued_total, 0);
    assert_eq!(stats.executor.active, 0);
}

#[test]
fn bounded_pool_completes_every_job() {
    let (scheduler, observer) = scheduler_with_observer(config(2).with_queue_capacity(2));
    scheduler.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    for i in 0..4 {
        let counter = Arc::clone(&counter);
        scheduler.submit(Job::new(format!("long-{i}"), move || {
            thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(())
        }));
    }

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(observer.successes(), 4);
}

#[test]
fn many_jobs_from_many_threads() {
    let (scheduler, observer) = scheduler_with_observer(config(4).with_queue_capacity(8));
    let scheduler = Arc::new(scheduler);
    scheduler.start().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let scheduler = Arc::clone(&scheduler);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for i in 0..50 {
                    scheduler.submit(
                        counting_job(&format!("p{p}-{i}"), &counter)
                            .with_delay(Duration::from_millis(i % 7)),
                    );
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert_eq!(observer.successes(), 200);
    assert!(scheduler.is_idle());
}

#[test]
fn deferred_retries_do_not_hold_workers() {
    let config = config(1).with_retry_delivery(RetryDelivery::Deferred);
    let (scheduler, observer) = scheduler_with_observer(config);
    scheduler.start().unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let task_attempts = Arc::clone(&attempts);
    scheduler.submit(
        Job::new("backing-off", move || {
            if task_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("first try fails")
            } else {
                Ok(())
            }
        })
        .with_retry_policy(FixedDelay::shared(Duration::from_millis(300))),
    );

    // Give the failing attempt time to run, then prove the single worker is
    // free while the retry waits in the queue.
    thread::sleep(Duration::from_millis(50));
    let quick = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    scheduler.submit(counting_job("quick", &quick));
    while quick.load(Ordering::SeqCst) == 0 {
        assert!(started.elapsed() < Duration::from_millis(200), "worker was blocked");
        thread::sleep(Duration::from_millis(2));
    }

    scheduler.wait_for_idle();
    scheduler.shutdown();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(observer.failures(), 1);
    assert_eq!(observer.successes(), 2);
}

#[test]
fn shutdown_is_idempotent_and_runs_on_drop() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let (scheduler, _observer) = scheduler_with_observer(config(2));
        scheduler.start().unwrap();
        scheduler.submit(counting_job("dropped", &counter).with_delay(Duration::from_millis(20)));
        scheduler.shutdown();
        scheduler.shutdown();
    }

    {
        let (scheduler, _observer) = scheduler_with_observer(config(2));
        scheduler.start().unwrap();
        scheduler.submit(
            counting_job("drop-flush", &counter).with_delay(Duration::from_millis(20)),
        );
        // Drop performs the shutdown, which flushes the accepted job.
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}
