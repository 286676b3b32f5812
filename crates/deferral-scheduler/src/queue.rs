//! Time-ordered ready queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error};

use crate::job::Job;

/// How long [`ReadyQueue::dequeue_ready`] waits on an empty queue before
/// returning `None`.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Heap entry ordered so the earliest deadline sits on top of the max-heap.
struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: earlier deadline, then earlier insertion, is "greater".
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    pending: usize,
    next_seq: u64,
    enqueued_total: u64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting in the heap.
    pub queued: usize,
    /// Jobs accepted but not yet terminally resolved (queued or in flight).
    pub pending: usize,
    /// Enqueue operations since creation, resubmissions included.
    pub enqueued_total: u64,
}

/// Thread-safe min-heap of jobs keyed by scheduled time.
///
/// The pending counter lives under the same lock as the heap, so
/// `pending >= len()` holds whenever callers increment before enqueueing.
#[derive(Default)]
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job and wake one waiter.
    pub fn enqueue(&self, job: Job) {
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.enqueued_total += 1;
            debug!(
                job_id = %job.id(),
                attempt = job.attempt(),
                queued = state.heap.len() + 1,
                "enqueued job"
            );
            state.heap.push(Entry {
                due: job.scheduled_time(),
                seq,
                job,
            });
        }
        self.available.notify_one();
    }

    /// Take the earliest job once its scheduled time has arrived.
    ///
    /// Waits on the earliest deadline while jobs are queued. Returns `None`
    /// after [`DEFAULT_IDLE_WAIT`] if the queue stays empty.
    pub fn dequeue_ready(&self) -> Option<Job> {
        self.dequeue_ready_timeout(DEFAULT_IDLE_WAIT)
    }

    /// Like [`dequeue_ready`](Self::dequeue_ready) with a caller-chosen wait
    /// for the empty-queue case. `idle_wait` does not bound the wait for a
    /// queued job's deadline.
    ///
    /// Also returns `None` if [`wake_all`](Self::wake_all) interrupts the
    /// wait on an empty queue.
    pub fn dequeue_ready_timeout(&self, idle_wait: Duration) -> Option<Job> {
        let idle_deadline = Instant::now() + idle_wait;
        let mut state = self.state.lock();

        loop {
            let Some(due) = state.heap.peek().map(|entry| entry.due) else {
                if Instant::now() >= idle_deadline {
                    return None;
                }
                let timed_out = self
                    .available
                    .wait_until(&mut state, idle_deadline)
                    .timed_out();
                if timed_out || state.heap.is_empty() {
                    return None;
                }
                continue;
            };

            if due <= Instant::now() {
                return state.heap.pop().map(|entry| entry.job);
            }

            // Woken early by a new (possibly earlier) job or by wake_all;
            // either way re-examine the top.
            self.available.wait_until(&mut state, due);
        }
    }

    /// Wake every thread blocked in a dequeue.
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Scheduled time of the earliest queued job.
    pub fn next_due(&self) -> Option<Instant> {
        self.state.lock().heap.peek().map(|entry| entry.due)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// True when no job is pending.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn increment_pending(&self) {
        self.state.lock().pending += 1;
    }

    pub fn decrement_pending(&self) {
        let mut state = self.state.lock();
        match state.pending.checked_sub(1) {
            Some(pending) => state.pending = pending,
            None => error!("pending count decremented below zero"),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.heap.len(),
            pending: state.pending,
            enqueued_total: state.enqueued_total,
        }
    }
}
