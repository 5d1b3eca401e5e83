//! Worker pool: spawns N job workers per node and supervises them.

use crate::job::QueuedJob;
use crate::registry::{JobError, JobRegistry};
use crate::JobSource;
use campaign_core::config::QueueConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Exponential backoff between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_ms: config.retry_backoff_ms,
            max_ms: config.max_backoff_ms,
        }
    }

    /// Delay before the attempt after `attempt` (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// What happened to one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay_ms: u64 },
    Exhausted,
    Dropped,
}

/// A single job worker pulling from a shared source.
#[derive(Clone)]
pub struct Worker {
    pub worker_id: String,
    source: Arc<dyn JobSource>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        worker_id: String,
        source: Arc<dyn JobSource>,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            worker_id,
            source,
            registry,
            retry,
        }
    }

    /// Spawn this worker as a Tokio task that runs until the source closes.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(worker_id = %self.worker_id, "Worker started");
            while let Some(queued) = self.source.next().await {
                self.process(queued).await;
            }
            info!(worker_id = %self.worker_id, "Job source closed, worker exiting");
        })
    }

    /// Run one job and schedule its retry if it failed retryably.
    pub async fn process(&self, queued: QueuedJob) -> JobOutcome {
        let name = queued.job.name.clone();
        match self.registry.dispatch(&queued.job).await {
            Ok(()) => {
                metrics::counter!("worker.jobs_completed", "job" => name).increment(1);
                JobOutcome::Completed
            }
            Err(JobError::Retryable(e)) if queued.has_attempts_left() => {
                let delay_ms = self.retry.delay_ms(queued.attempt);
                warn!(
                    worker_id = %self.worker_id,
                    job = %name,
                    attempt = queued.attempt,
                    delay_ms,
                    error = %e,
                    "Job failed, retrying"
                );
                metrics::counter!("worker.jobs_retried", "job" => name).increment(1);
                if let Err(e) = self.source.retry(queued, delay_ms).await {
                    error!(worker_id = %self.worker_id, error = %e, "Failed to schedule retry");
                }
                JobOutcome::Retrying { delay_ms }
            }
            Err(JobError::Retryable(e)) => {
                error!(
                    worker_id = %self.worker_id,
                    job = %name,
                    attempts = queued.attempt,
                    error = %e,
                    "Job failed, attempts exhausted"
                );
                metrics::counter!("worker.jobs_failed", "job" => name).increment(1);
                JobOutcome::Exhausted
            }
            Err(JobError::Terminal(e)) => {
                error!(worker_id = %self.worker_id, job = %name, error = %e, "Job dropped");
                metrics::counter!("worker.jobs_failed", "job" => name).increment(1);
                JobOutcome::Dropped
            }
        }
    }
}

/// Manages the lifecycle of all job workers on this node.
pub struct WorkerPool {
    node_id: String,
    workers: usize,
    source: Arc<dyn JobSource>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        node_id: String,
        workers: usize,
        source: Arc<dyn JobSource>,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node_id,
            workers: workers.max(1),
            source,
            registry,
            retry,
            handles: Vec::new(),
        }
    }

    /// A worker bound to this pool's source and registry, not spawned.
    pub fn worker(&self, index: usize) -> Worker {
        Worker::new(
            format!("{}-worker-{:02}", self.node_id, index),
            self.source.clone(),
            self.registry.clone(),
            self.retry,
        )
    }

    /// Spawn all workers.
    pub fn start(&mut self) {
        for i in 0..self.workers {
            let worker = self.worker(i);
            let worker_id = worker.worker_id.clone();
            self.handles.push(worker.spawn());
            info!(worker_id = %worker_id, "Worker spawned");
        }

        info!(
            count = self.workers,
            node = %self.node_id,
            jobs = ?self.registry.names(),
            "All workers started"
        );
    }

    /// Wait for all workers to finish (after the source closes).
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::memory::MemoryQueue;
    use crate::registry::JobHandler;
    use crate::JobQueue;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(anyhow::anyhow!("transient").into())
            } else {
                Ok(())
            }
        }
    }

    fn setup(fail_times: u32) -> (Arc<MemoryQueue>, Arc<Flaky>, Worker) {
        let queue = Arc::new(MemoryQueue::default());
        let handler = Arc::new(Flaky {
            fail_times,
            calls: AtomicU32::new(0),
        });
        let mut registry = JobRegistry::new();
        registry.register("flaky", handler.clone());
        let worker = Worker::new(
            "test-worker".into(),
            queue.clone(),
            Arc::new(registry),
            RetryPolicy {
                base_ms: 1000,
                max_ms: 3000,
            },
        );
        (queue, handler, worker)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_ms: 1000,
            max_ms: 3000,
        };
        assert_eq!(policy.delay_ms(1), 1000);
        assert_eq!(policy.delay_ms(2), 2000);
        assert_eq!(policy.delay_ms(3), 3000);
        assert_eq!(policy.delay_ms(40), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let (queue, handler, worker) = setup(1);
        queue.enqueue(Job::new("flaky", json!({}))).await.unwrap();

        let first = queue.try_next().unwrap();
        assert_eq!(
            worker.process(first).await,
            JobOutcome::Retrying { delay_ms: 1000 }
        );
        assert!(queue.try_next().is_none());

        tokio::time::advance(Duration::from_millis(1000)).await;
        let second = queue.try_next().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(worker.process(second).await, JobOutcome::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let (queue, _handler, worker) = setup(10);
        queue
            .enqueue(Job::new("flaky", json!({})).with_attempts(1))
            .await
            .unwrap();
        let only = queue.try_next().unwrap();
        assert_eq!(worker.process(only).await, JobOutcome::Exhausted);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_dropped() {
        let (queue, _handler, worker) = setup(0);
        queue.enqueue(Job::new("mystery", json!({}))).await.unwrap();
        let job = queue.try_next().unwrap();
        assert_eq!(worker.process(job).await, JobOutcome::Dropped);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_and_stops() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let handler = Arc::new(Flaky {
            fail_times: 0,
            calls: AtomicU32::new(0),
        });
        let mut registry = JobRegistry::new();
        registry.register("flaky", handler.clone());

        for _ in 0..5 {
            queue.enqueue(Job::new("flaky", json!({}))).await.unwrap();
        }

        let mut pool = WorkerPool::new(
            "node".into(),
            3,
            queue.clone(),
            Arc::new(registry),
            RetryPolicy::default(),
        );
        pool.start();
        assert_eq!(pool.worker_count(), 3);

        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close();
        pool.wait().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }
}
