//! Provider send throttling. Each provider gets a fixed window of
//! `rate_window_ms`; a send past `rate_limit` in the current window is
//! reported as exceeded together with the time left until the window
//! resets, so the caller can defer instead of blocking.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of counting one send against a provider's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleResult {
    pub exceeded: bool,
    /// Time until the current window resets.
    pub ms_remaining: u64,
}

#[async_trait]
pub trait ProviderThrottle: Send + Sync {
    /// Count one send for `provider_id`. Returns `None` when the provider
    /// is unlimited (`rate_limit == 0`). An exceeded check is not counted.
    async fn throttle_send(
        &self,
        provider_id: i64,
        rate_limit: u32,
    ) -> anyhow::Result<Option<ThrottleResult>>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-process fixed windows. Only correct when a single worker process
/// sends through a given provider.
#[derive(Clone)]
pub struct MemoryThrottle {
    window: Duration,
    windows: Arc<DashMap<i64, Window>>,
}

impl MemoryThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            windows: Arc::new(DashMap::new()),
        }
    }

    /// Sends counted in the provider's current window.
    pub fn current(&self, provider_id: i64) -> u32 {
        self.windows
            .get(&provider_id)
            .filter(|w| w.started.elapsed() < self.window)
            .map(|w| w.count)
            .unwrap_or(0)
    }
}

impl Default for MemoryThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl ProviderThrottle for MemoryThrottle {
    async fn throttle_send(
        &self,
        provider_id: i64,
        rate_limit: u32,
    ) -> anyhow::Result<Option<ThrottleResult>> {
        if rate_limit == 0 {
            return Ok(None);
        }

        let now = Instant::now();
        let mut window = self.windows.entry(provider_id).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        let remaining = self.window.saturating_sub(now.duration_since(window.started));
        let exceeded = window.count >= rate_limit;
        if !exceeded {
            window.count += 1;
        }
        let result = ThrottleResult {
            exceeded,
            ms_remaining: remaining.as_millis() as u64,
        };
        drop(window);

        if exceeded {
            metrics::counter!("throttle.exceeded").increment(1);
            debug!(provider_id, rate_limit, ms_remaining = result.ms_remaining, "Provider rate exceeded");
        }
        Ok(Some(result))
    }
}

/// Count a send in the provider's window. A key that is missing or has
/// no expiry opens a new window. A check over the limit is not counted.
/// Returns `{exceeded, ms_remaining}`.
const THROTTLE_SCRIPT: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
  return {0, tonumber(ARGV[2])}
end
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= tonumber(ARGV[1]) then
  return {1, ttl}
end
redis.call('INCR', KEYS[1])
return {0, ttl}
"#;

/// Fixed windows shared by every worker through Redis. Each check runs as
/// one script on a per-provider key whose TTL is the window.
#[derive(Clone)]
pub struct RedisThrottle {
    conn: ConnectionManager,
    script: Arc<Script>,
    window_ms: u64,
    prefix: String,
}

impl RedisThrottle {
    pub fn from_connection(conn: ConnectionManager, window_ms: u64) -> Self {
        Self {
            conn,
            script: Arc::new(Script::new(THROTTLE_SCRIPT)),
            window_ms: window_ms.max(1),
            prefix: "throttle:".to_string(),
        }
    }

    fn key(&self, provider_id: i64) -> String {
        format!("{}{}", self.prefix, provider_id)
    }
}

#[async_trait]
impl ProviderThrottle for RedisThrottle {
    async fn throttle_send(
        &self,
        provider_id: i64,
        rate_limit: u32,
    ) -> anyhow::Result<Option<ThrottleResult>> {
        if rate_limit == 0 {
            return Ok(None);
        }

        let mut conn = self.conn.clone();
        let (exceeded, ms_remaining): (i64, i64) = self
            .script
            .key(self.key(provider_id))
            .arg(rate_limit)
            .arg(self.window_ms)
            .invoke_async(&mut conn)
            .await?;

        let result = ThrottleResult {
            exceeded: exceeded == 1,
            ms_remaining: ms_remaining.max(0) as u64,
        };
        if result.exceeded {
            metrics::counter!("throttle.exceeded").increment(1);
            debug!(provider_id, rate_limit, ms_remaining = result.ms_remaining, "Provider rate exceeded");
        }
        Ok(Some(result))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_limit_and_reset() {
        let throttle = MemoryThrottle::new(Duration::from_millis(1000));

        for _ in 0..3 {
            let result = throttle.throttle_send(1, 3).await.unwrap().unwrap();
            assert!(!result.exceeded);
        }
        assert_eq!(throttle.current(1), 3);

        tokio::time::advance(Duration::from_millis(400)).await;
        let result = throttle.throttle_send(1, 3).await.unwrap().unwrap();
        assert!(result.exceeded);
        assert_eq!(result.ms_remaining, 600);
        assert_eq!(throttle.current(1), 3);

        tokio::time::advance(Duration::from_millis(600)).await;
        let result = throttle.throttle_send(1, 3).await.unwrap().unwrap();
        assert!(!result.exceeded);
        assert_eq!(throttle.current(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeded_checks_are_not_counted() {
        let throttle = MemoryThrottle::new(Duration::from_millis(1000));
        assert!(!throttle.throttle_send(1, 1).await.unwrap().unwrap().exceeded);

        for elapsed in [100, 200, 300] {
            tokio::time::advance(Duration::from_millis(100)).await;
            let result = throttle.throttle_send(1, 1).await.unwrap().unwrap();
            assert!(result.exceeded);
            assert_eq!(result.ms_remaining, 1000 - elapsed);
            assert_eq!(throttle.current(1), 1);
        }

        // Rejected checks did not move the window, so it still ends on time.
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(!throttle.throttle_send(1, 1).await.unwrap().unwrap().exceeded);
    }

    #[tokio::test]
    async fn test_unlimited_provider() {
        let throttle = MemoryThrottle::default();
        assert_eq!(throttle.throttle_send(1, 0).await.unwrap(), None);
        assert_eq!(throttle.current(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_providers_have_separate_windows() {
        let throttle = MemoryThrottle::default();
        assert!(!throttle.throttle_send(1, 1).await.unwrap().unwrap().exceeded);
        assert!(throttle.throttle_send(1, 1).await.unwrap().unwrap().exceeded);
        assert!(!throttle.throttle_send(2, 1).await.unwrap().unwrap().exceeded);
    }
}
