//! Rule orchestrator: whole-tree truth values from cached event results
//! plus live user facts, kept current incrementally as events arrive.

use crate::cache::EvaluationCache;
use crate::engine::{check_combinator, evaluate, Evaluator};
use crate::store::RuleStore;
use crate::tree::{compile_rule, decompile_rule, NestedRule, RuleTree};
use crate::types::{Rule, RuleKind};
use campaign_core::types::{Facts, User, UserEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Root rule uuids partitioned by their current truth value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResults {
    pub success: Vec<Uuid>,
    pub failure: Vec<Uuid>,
}

impl RuleResults {
    pub fn is_success(&self, root_uuid: &Uuid) -> bool {
        self.success.contains(root_uuid)
    }

    pub fn is_failure(&self, root_uuid: &Uuid) -> bool {
        self.failure.contains(root_uuid)
    }

    fn push(&mut self, root_uuid: Uuid, result: bool) {
        if result {
            self.success.push(root_uuid);
        } else {
            self.failure.push(root_uuid);
        }
    }
}

/// Outcome of merging an authored tree into storage.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub inserted: Vec<Rule>,
    pub deleted: Vec<i64>,
}

pub struct RuleOrchestrator {
    store: Arc<dyn RuleStore>,
    cache: Arc<dyn EvaluationCache>,
}

impl RuleOrchestrator {
    pub fn new(store: Arc<dyn RuleStore>, cache: Arc<dyn EvaluationCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    async fn load_tree(&self, project_id: i64, root_uuid: Uuid) -> anyhow::Result<Option<RuleTree>> {
        let rows = self.store.rules_for_root(project_id, root_uuid).await?;
        Ok(RuleTree::from_rows(root_uuid, &rows))
    }

    /// Nested view of a stored tree.
    pub async fn fetch_and_compile_rule(
        &self,
        project_id: i64,
        root_uuid: Uuid,
    ) -> anyhow::Result<Option<NestedRule>> {
        let rows = self.store.rules_for_root(project_id, root_uuid).await?;
        Ok(rows.first().map(|root| compile_rule(root, &rows)))
    }

    /// Truth value of a stored root for `user`: user subtrees evaluated
    /// live, event nodes read from the cache (missing is false).
    pub async fn check_root_rule(&self, root_uuid: Uuid, user: &User) -> anyhow::Result<bool> {
        let Some(tree) = self.load_tree(user.project_id, root_uuid).await? else {
            debug!(root = %root_uuid, "Root rule not found");
            return Ok(false);
        };

        let event_ids: Vec<i64> = tree
            .nodes()
            .iter()
            .filter(|r| r.is_event_node())
            .map(|r| r.id)
            .collect();
        let cached = self.cache.results_for(user.id, &event_ids).await?;

        Ok(check_rules(&tree, &cached, user))
    }

    /// Re-evaluate the event nodes named by `event`, record new truths and
    /// recompute each owning root once. Nodes for other events, and every
    /// user leaf, are left alone.
    pub async fn matching_rules_for_event(
        &self,
        user: &User,
        event: &UserEvent,
    ) -> anyhow::Result<RuleResults> {
        let nodes = self.store.event_rules(user.project_id, &event.name).await?;
        let facts = Facts::with_event(user, event);

        let mut trees: HashMap<Uuid, RuleTree> = HashMap::new();
        let mut roots: Vec<Uuid> = Vec::new();

        for node in nodes {
            let root_uuid = node.root_uuid.unwrap_or(node.uuid);
            if !trees.contains_key(&root_uuid) {
                let Some(tree) = self.load_tree(user.project_id, root_uuid).await? else {
                    continue;
                };
                trees.insert(root_uuid, tree);
            }
            let Some(tree) = trees.get(&root_uuid) else {
                continue;
            };
            let Some(position) = tree.position(&node.uuid) else {
                continue;
            };

            if evaluate(&facts, tree, position) {
                self.cache.upsert(node.id, user.id, true).await?;
                metrics::counter!("rules.event_matches").increment(1);
                debug!(rule_id = node.id, user_id = user.id, event = %event.name, "Event rule matched");
            }
            if !roots.contains(&root_uuid) {
                roots.push(root_uuid);
            }
        }

        let mut results = RuleResults::default();
        for root_uuid in roots {
            let result = self.check_root_rule(root_uuid, user).await?;
            results.push(root_uuid, result);
        }
        Ok(results)
    }

    /// Recompute every top-level rule of the user's project from scratch.
    pub async fn matching_rules_for_user(&self, user: &User) -> anyhow::Result<RuleResults> {
        let roots = self.store.root_rules(user.project_id).await?;
        let mut results = RuleResults::default();
        for root in roots {
            let result = self.check_root_rule(root.uuid, user).await?;
            results.push(root.uuid, result);
        }
        Ok(results)
    }

    /// Merge an authored tree into storage. Unchanged rows keep their ids
    /// and cache entries; new or changed rows are (re)inserted under fresh
    /// ids, and every removed id has its cache entries dropped.
    pub async fn merge_insert_rules(
        &self,
        project_id: i64,
        tree: &NestedRule,
    ) -> anyhow::Result<MergeResult> {
        let rows: Vec<Rule> = decompile_rule(tree)
            .into_iter()
            .map(|mut rule| {
                rule.project_id = project_id;
                rule
            })
            .collect();
        let root_uuid = tree.rule.uuid;
        let previous = self.store.rules_for_root(project_id, root_uuid).await?;

        let mut fresh = Vec::new();
        let mut deleted = Vec::new();
        for row in &rows {
            match previous.iter().find(|p| p.uuid == row.uuid) {
                Some(prev) if prev.same_content(row) => {}
                Some(prev) => {
                    deleted.push(prev.id);
                    fresh.push(Rule { id: 0, ..row.clone() });
                }
                None => fresh.push(row.clone()),
            }
        }
        for prev in &previous {
            if !rows.iter().any(|r| r.uuid == prev.uuid) {
                deleted.push(prev.id);
            }
        }

        if !deleted.is_empty() {
            self.store.delete(&deleted).await?;
            self.cache.invalidate_rules(&deleted).await?;
        }
        let inserted = if fresh.is_empty() {
            Vec::new()
        } else {
            self.store.insert(fresh).await?
        };

        info!(
            project_id,
            root = %root_uuid,
            inserted = inserted.len(),
            deleted = deleted.len(),
            "Merged rule tree"
        );
        Ok(MergeResult { inserted, deleted })
    }
}

/// Evaluate a stored tree using cached event results.
pub fn check_rules(tree: &RuleTree, cached: &HashMap<i64, bool>, user: &User) -> bool {
    let facts = Facts::for_user(user);
    let live = Evaluator::new(&facts, tree);
    resolve(tree, RuleTree::ROOT, cached, &live)
}

fn resolve(tree: &RuleTree, position: usize, cached: &HashMap<i64, bool>, live: &Evaluator<'_>) -> bool {
    let rule = tree.node(position);
    if rule.is_event_node() {
        return cached.get(&rule.id).copied().unwrap_or(false);
    }
    match &rule.kind {
        RuleKind::Wrapper { operator, .. } => {
            let results: HashMap<i64, bool> = tree
                .children(position)
                .iter()
                .map(|&child| (tree.node(child).id, resolve(tree, child, cached, live)))
                .collect();
            check_combinator(&results, *operator)
        }
        _ => live.node(position, None),
    }
}
