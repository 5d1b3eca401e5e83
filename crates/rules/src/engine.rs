//! Pure rule evaluation over a fact set.

use crate::operators::{default_table, OperatorTable};
use crate::tree::{json_pointer, NestedRule, RuleTree};
use crate::types::{Combinator, RuleGroup, RuleKind};
use campaign_core::types::Facts;
use serde_json::Value;
use std::collections::HashMap;

/// Evaluate a whole tree against `facts` with the default operator table.
pub fn check(facts: &Facts, rule: &NestedRule) -> bool {
    let tree = RuleTree::from_nested(rule);
    evaluate(facts, &tree, RuleTree::ROOT)
}

/// Evaluate the node at `position` and everything below it.
pub fn evaluate(facts: &Facts, tree: &RuleTree, position: usize) -> bool {
    Evaluator::new(facts, tree).node(position, None)
}

/// Apply a combinator over pre-computed results instead of live children.
pub fn check_combinator(results: &HashMap<i64, bool>, operator: Combinator) -> bool {
    operator.apply(results.values().copied())
}

/// Walks one tree, carrying the event an event node bound for its children.
pub struct Evaluator<'a> {
    facts: &'a Facts,
    tree: &'a RuleTree,
    table: &'a OperatorTable,
}

impl<'a> Evaluator<'a> {
    pub fn new(facts: &'a Facts, tree: &'a RuleTree) -> Self {
        Self::with_table(facts, tree, default_table())
    }

    pub fn with_table(facts: &'a Facts, tree: &'a RuleTree, table: &'a OperatorTable) -> Self {
        Self { facts, tree, table }
    }

    pub fn node(&self, position: usize, event: Option<&Value>) -> bool {
        let rule = self.tree.node(position);
        match &rule.kind {
            RuleKind::Wrapper { operator, value } => {
                if rule.group == RuleGroup::Event {
                    self.event_node(position, *operator, value.as_deref())
                } else {
                    self.combine(position, *operator, event)
                }
            }
            _ => self.leaf(position, event),
        }
    }

    /// True when some event with the node's name satisfies its children.
    fn event_node(&self, position: usize, operator: Combinator, name: Option<&str>) -> bool {
        self.facts
            .events
            .iter()
            .filter(|event| match name {
                Some(name) => event.get("name").and_then(Value::as_str) == Some(name),
                None => true,
            })
            .any(|event| {
                self.tree.children(position).is_empty() || self.combine(position, operator, Some(event))
            })
    }

    fn combine(&self, position: usize, operator: Combinator, event: Option<&Value>) -> bool {
        operator.apply(
            self.tree
                .children(position)
                .iter()
                .map(|&child| self.node(child, event)),
        )
    }

    fn leaf(&self, position: usize, event: Option<&Value>) -> bool {
        let rule = self.tree.node(position);
        let Some((ty, operator, expected)) = rule.kind.leaf() else {
            return false;
        };
        let pointer = json_pointer(&rule.path);
        let test = |source: &Value| {
            let actual = source.pointer(&pointer).unwrap_or(&Value::Null);
            self.table.apply(ty, operator, actual, &expected)
        };

        match rule.group {
            RuleGroup::Event => match event {
                Some(event) => test(event),
                None => self.facts.events.iter().any(test),
            },
            RuleGroup::User | RuleGroup::Parent => test(&self.facts.user),
        }
    }
}
