//! In-process lock table backed by DashMap.
//! Enough for a single worker process and for tests; use `RedisLock` when
//! several processes share a queue.

use crate::lock::DistributedLock;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lock records keyed by name, each holding its expiry instant.
#[derive(Default, Clone)]
pub struct LocalLock {
    store: Arc<DashMap<String, Instant>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired record exists for `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.store
            .get(key)
            .map(|expires_at| *expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Remove expired records. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, expires_at| *expires_at > now);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn acquire(&self, key: &str, timeout_secs: u64) -> anyhow::Result<bool> {
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(timeout_secs);

        // The entry guard makes check-and-set atomic per key.
        let acquired = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    false
                } else {
                    held.insert(expires_at);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> anyhow::Result<()> {
        self.store.remove(key);
        Ok(())
    }
}
