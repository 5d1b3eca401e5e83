//! Lock contract shared by every backend.

use async_trait::async_trait;
use std::future::Future;
use tracing::debug;

/// Key-based mutual exclusion with bounded expiry.
///
/// Holding a lock means a live record exists for `key`. Records expire on
/// their own; expiry is the only recovery path for a holder that dies.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `key` for `timeout_secs`. Never waits: returns `false`
    /// immediately when an unexpired holder exists.
    async fn acquire(&self, key: &str, timeout_secs: u64) -> anyhow::Result<bool>;

    /// Drop the record for `key`.
    async fn release(&self, key: &str) -> anyhow::Result<()>;
}

/// Run `work` while holding `key`.
///
/// Returns `Ok(None)` without running anything when the lock is already
/// held elsewhere. The lock is released after `work` succeeds; an error
/// leaves it in place until it expires.
pub async fn with_lock<F, Fut, T>(
    lock: &dyn DistributedLock,
    key: &str,
    timeout_secs: u64,
    work: F,
) -> anyhow::Result<Option<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if !lock.acquire(key, timeout_secs).await? {
        metrics::counter!("lock.contended").increment(1);
        debug!(key = %key, "Lock held elsewhere, skipping");
        return Ok(None);
    }
    metrics::counter!("lock.acquired").increment(1);

    let value = work().await?;
    lock.release(key).await?;
    Ok(Some(value))
}

/// Lock expiry for audience generation: one second per `users_per_second`
/// candidates, never below `min_secs`.
pub fn generation_timeout_secs(estimated_size: u64, users_per_second: u64, min_secs: u64) -> u64 {
    let budget = estimated_size.div_ceil(users_per_second.max(1));
    budget.max(min_secs)
}
