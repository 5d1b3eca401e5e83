//! Job queue contract: named jobs with delay, attempt budget and an
//! idempotency key, dispatched to handlers registered by name.
//!
//! The durable transport is external; `MemoryQueue` is the in-process
//! implementation used by single-node workers and tests.

pub mod job;
pub mod memory;
pub mod registry;
pub mod worker;

pub use job::{Job, JobOptions, QueuedJob};
pub use memory::MemoryQueue;
pub use registry::{JobError, JobHandler, JobRegistry};
pub use worker::{JobOutcome, RetryPolicy, Worker, WorkerPool};

use async_trait::async_trait;

/// Producer side of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule `job`. A job whose `job_id` matches one that is already
    /// pending is dropped instead of duplicated.
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
}

/// Consumer side of the queue, pulled by workers.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Wait for the next ready job. `None` once the source is closed and drained.
    async fn next(&self) -> Option<QueuedJob>;

    /// Put a failed delivery back with its attempt counter advanced.
    async fn retry(&self, job: QueuedJob, delay_ms: u64) -> anyhow::Result<()>;
}
