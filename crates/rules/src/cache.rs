//! Per-(rule, user) evaluation results. Writes are upserts: one entry per
//! key no matter how many workers race on it.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait EvaluationCache: Send + Sync {
    /// Cached results for `user_id` among `rule_ids`. Missing keys are absent.
    async fn results_for(&self, user_id: i64, rule_ids: &[i64]) -> anyhow::Result<HashMap<i64, bool>>;

    /// Insert or overwrite the result for `(rule_id, user_id)`.
    async fn upsert(&self, rule_id: i64, user_id: i64, result: bool) -> anyhow::Result<()>;

    /// Drop every user's entry for the given rule rows.
    async fn invalidate_rules(&self, rule_ids: &[i64]) -> anyhow::Result<()>;
}

/// DashMap-backed cache for single-process workers and tests.
#[derive(Default, Clone)]
pub struct MemoryEvaluationCache {
    entries: Arc<DashMap<(i64, i64), bool>>,
}

impl MemoryEvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rule_id: i64, user_id: i64) -> Option<bool> {
        self.entries.get(&(rule_id, user_id)).map(|r| *r)
    }

    /// Rule ids with an entry for this user.
    pub fn rules_for_user(&self, user_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .entries
            .iter()
            .filter(|e| e.key().1 == user_id)
            .map(|e| e.key().0)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EvaluationCache for MemoryEvaluationCache {
    async fn results_for(&self, user_id: i64, rule_ids: &[i64]) -> anyhow::Result<HashMap<i64, bool>> {
        Ok(rule_ids
            .iter()
            .filter_map(|&id| self.get(id, user_id).map(|result| (id, result)))
            .collect())
    }

    async fn upsert(&self, rule_id: i64, user_id: i64, result: bool) -> anyhow::Result<()> {
        self.entries.insert((rule_id, user_id), result);
        Ok(())
    }

    async fn invalidate_rules(&self, rule_ids: &[i64]) -> anyhow::Result<()> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        let before = self.entries.len();
        self.entries.retain(|(rule_id, _), _| !rule_ids.contains(rule_id));
        debug!(
            rules = rule_ids.len(),
            removed = before - self.entries.len(),
            "Invalidated evaluation cache entries"
        );
        Ok(())
    }
}

/// Redis-backed cache: one hash per rule row, field = user id.
#[derive(Clone)]
pub struct RedisEvaluationCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisEvaluationCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: "rule_evaluations:".to_string(),
        }
    }

    fn key(&self, rule_id: i64) -> String {
        format!("{}{}", self.prefix, rule_id)
    }
}

#[async_trait]
impl EvaluationCache for RedisEvaluationCache {
    async fn results_for(&self, user_id: i64, rule_ids: &[i64]) -> anyhow::Result<HashMap<i64, bool>> {
        if rule_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for &rule_id in rule_ids {
            pipe.cmd("HGET").arg(self.key(rule_id)).arg(user_id);
        }
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        Ok(rule_ids
            .iter()
            .zip(values)
            .filter_map(|(&id, value)| value.map(|v| (id, v == "1")))
            .collect())
    }

    async fn upsert(&self, rule_id: i64, user_id: i64, result: bool) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(self.key(rule_id))
            .arg(user_id)
            .arg(if result { "1" } else { "0" })
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate_rules(&self, rule_ids: &[i64]) -> anyhow::Result<()> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = rule_ids.iter().map(|&id| self.key(id)).collect();
        let removed: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        debug!(rules = rule_ids.len(), removed, "Invalidated evaluation cache hashes");
        Ok(())
    }
}
