//! Rule persistence contract and its in-memory implementation.

use crate::types::{Rule, RuleGroup};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn find_by_uuid(&self, project_id: i64, uuid: Uuid) -> anyhow::Result<Option<Rule>>;

    /// The root row first, then every row whose `root_uuid` is `root_uuid`.
    async fn rules_for_root(&self, project_id: i64, root_uuid: Uuid) -> anyhow::Result<Vec<Rule>>;

    /// Top-level `parent` wrappers of a project.
    async fn root_rules(&self, project_id: i64) -> anyhow::Result<Vec<Rule>>;

    /// Event nodes whose event name is `event_name`.
    async fn event_rules(&self, project_id: i64, event_name: &str) -> anyhow::Result<Vec<Rule>>;

    /// Insert rows, assigning fresh ids. Returns the stored rows.
    async fn insert(&self, rules: Vec<Rule>) -> anyhow::Result<Vec<Rule>>;

    async fn delete(&self, ids: &[i64]) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct MemoryRuleStore {
    rows: Arc<DashMap<i64, Rule>>,
    next_id: Arc<AtomicI64>,
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn select(&self, predicate: impl Fn(&Rule) -> bool) -> Vec<Rule> {
        let mut rows: Vec<Rule> = self
            .rows
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn find_by_uuid(&self, project_id: i64, uuid: Uuid) -> anyhow::Result<Option<Rule>> {
        Ok(self
            .select(|r| r.project_id == project_id && r.uuid == uuid)
            .into_iter()
            .next())
    }

    async fn rules_for_root(&self, project_id: i64, root_uuid: Uuid) -> anyhow::Result<Vec<Rule>> {
        let mut rows = self.select(|r| {
            r.project_id == project_id && (r.uuid == root_uuid || r.root_uuid == Some(root_uuid))
        });
        // Root first; the rest stay in id order.
        if let Some(pos) = rows.iter().position(|r| r.uuid == root_uuid) {
            let root = rows.remove(pos);
            rows.insert(0, root);
        }
        Ok(rows)
    }

    async fn root_rules(&self, project_id: i64) -> anyhow::Result<Vec<Rule>> {
        Ok(self.select(|r| {
            r.project_id == project_id
                && r.is_root()
                && r.group == RuleGroup::Parent
                && r.kind.is_wrapper()
        }))
    }

    async fn event_rules(&self, project_id: i64, event_name: &str) -> anyhow::Result<Vec<Rule>> {
        Ok(self.select(|r| r.project_id == project_id && r.event_name() == Some(event_name)))
    }

    async fn insert(&self, rules: Vec<Rule>) -> anyhow::Result<Vec<Rule>> {
        let mut stored = Vec::with_capacity(rules.len());
        for mut rule in rules {
            rule.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.rows.insert(rule.id, rule.clone());
            stored.push(rule);
        }
        Ok(stored)
    }

    async fn delete(&self, ids: &[i64]) -> anyhow::Result<()> {
        for id in ids {
            self.rows.remove(id);
        }
        Ok(())
    }
}
