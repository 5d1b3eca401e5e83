//! Redis-backed lock shared by every worker process.
//! A lock is a `SET key NX EX timeout` record; the key's TTL is the expiry.

use crate::lock::DistributedLock;
use async_trait::async_trait;
use campaign_core::config::RedisConfig;
use campaign_core::error::{CampaignError, CampaignResult};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

/// Open a connection manager and verify it with a PING. One manager is
/// shared by the lock, the evaluation cache and the throttle.
pub async fn connect(config: &RedisConfig) -> CampaignResult<ConnectionManager> {
    info!(url = %config.url, "Connecting to Redis");

    let client = redis::Client::open(config.url.as_str()).map_err(redis_error)?;
    let mut conn = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        client.get_connection_manager(),
    )
    .await
    .map_err(|_| {
        CampaignError::Redis(format!("connect timed out after {}ms", config.connect_timeout_ms))
    })?
    .map_err(redis_error)?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(redis_error)?;
    info!(response = %pong, "Redis connection established");
    Ok(conn)
}

fn redis_error(err: redis::RedisError) -> CampaignError {
    CampaignError::Redis(err.to_string())
}

/// Distributed lock over a Redis connection manager.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisLock {
    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: "lock:".to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, timeout_secs: u64) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(timeout_secs.max(1))
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        debug!(key = %key, timeout_secs, acquired, "Redis lock acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        debug!(key = %key, "Redis lock released");
        Ok(())
    }
}
