//! In-process job queue with delayed delivery and job-id dedup.

use crate::job::{Job, QueuedJob};
use crate::{JobQueue, JobSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

struct Entry {
    ready_at: Instant,
    seq: u64,
    queued: QueuedJob,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn is_pending(&self, job_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.queued.job.options.job_id.as_deref() == Some(job_id))
    }

    /// Index of the entry that should run next: earliest `ready_at`, then FIFO.
    fn next_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.ready_at, e.seq))
            .map(|(i, _)| i)
    }
}

/// Pending jobs held in memory, ordered by ready time.
///
/// Jobs leave the pending set when a worker takes them, so a running job
/// may re-enqueue itself under the same `job_id`.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    poll_interval: Duration,
}

impl MemoryQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    /// Add a job. Returns `false` when a pending job already holds its `job_id`.
    pub fn push(&self, queued: QueuedJob) -> bool {
        let mut state = self.state.lock();
        if let Some(job_id) = queued.job.options.job_id.as_deref() {
            if state.is_pending(job_id) {
                debug!(job = %queued.job.name, job_id = %job_id, "Duplicate job id, skipping");
                metrics::counter!("queue.deduplicated").increment(1);
                return false;
            }
        }

        let ready_at = Instant::now() + Duration::from_millis(queued.job.options.delay_ms);
        state.seq += 1;
        let seq = state.seq;
        state.entries.push(Entry {
            ready_at,
            seq,
            queued,
        });
        drop(state);

        metrics::counter!("queue.enqueued").increment(1);
        self.notify.notify_one();
        true
    }

    /// Take the next job if one is ready now.
    pub fn try_next(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock();
        let index = state.next_index()?;
        if state.entries[index].ready_at > Instant::now() {
            return None;
        }
        Some(state.entries.swap_remove(index).queued)
    }

    /// Snapshot of every pending job, ready or delayed, in run order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state.entries.iter().collect();
        entries.sort_by_key(|e| (e.ready_at, e.seq));
        entries.iter().map(|e| e.queued.job.clone()).collect()
    }

    /// Time until the given pending job becomes ready, zero if it already is.
    pub fn ready_in(&self, job_id: &str) -> Option<Duration> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .find(|e| e.queued.job.options.job_id.as_deref() == Some(job_id))
            .map(|e| e.ready_at.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out jobs. Workers blocked in `next` return `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.push(QueuedJob::first(job));
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn next(&self) -> Option<QueuedJob> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                match state.next_index() {
                    Some(index) => {
                        let ready_at = state.entries[index].ready_at;
                        if ready_at <= Instant::now() {
                            return Some(state.entries.swap_remove(index).queued);
                        }
                        ready_at.saturating_duration_since(Instant::now())
                    }
                    None => self.poll_interval,
                }
            };

            // Wake on a new job, on the earliest ready time, or on the poll tick.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait.min(self.poll_interval)) => {}
            }
        }
    }

    async fn retry(&self, mut job: QueuedJob, delay_ms: u64) -> anyhow::Result<()> {
        job.attempt += 1;
        job.job.options.delay_ms = delay_ms;
        let (name, attempt) = (job.job.name.clone(), job.attempt);
        let job_id = job.job.options.job_id.clone();
        if !self.push(job) {
            // The handler already re-enqueued this job id; that copy wins.
            metrics::counter!("queue.retry_superseded").increment(1);
            warn!(job = %name, job_id = ?job_id, attempt, "Retry dropped, job id already pending");
        }
        Ok(())
    }
}
