//! Flat rows ↔ tree views. `RuleTree` is the arena used for evaluation;
//! `NestedRule` is the authoring shape.

use crate::types::Rule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Nested view of a rule: the row plus its ordered children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedRule {
    #[serde(flatten)]
    pub rule: Rule,
    #[serde(default)]
    pub children: Vec<NestedRule>,
}

impl NestedRule {
    pub fn new(rule: Rule, children: Vec<NestedRule>) -> Self {
        Self { rule, children }
    }

    pub fn leaf(rule: Rule) -> Self {
        Self::new(rule, Vec::new())
    }
}

/// Arena of one rule tree: nodes in traversal order, root at position 0,
/// with parent→children adjacency built once per load.
#[derive(Debug, Clone)]
pub struct RuleTree {
    nodes: Vec<Rule>,
    children: Vec<Vec<usize>>,
    index: HashMap<Uuid, usize>,
}

impl RuleTree {
    /// Build from stored rows. Rows not reachable from `root_uuid` are
    /// ignored; children keep the order the rows came in.
    pub fn from_rows(root_uuid: Uuid, rows: &[Rule]) -> Option<Self> {
        let root = rows.iter().find(|r| r.uuid == root_uuid)?;

        let mut by_parent: HashMap<Uuid, Vec<&Rule>> = HashMap::new();
        for row in rows {
            if let Some(parent) = row.parent_uuid {
                if row.uuid != root_uuid {
                    by_parent.entry(parent).or_default().push(row);
                }
            }
        }

        let mut tree = RuleTree {
            nodes: Vec::with_capacity(rows.len()),
            children: Vec::with_capacity(rows.len()),
            index: HashMap::with_capacity(rows.len()),
        };
        tree.push(root.clone());

        // Breadth-first so every parent is placed before its children.
        let mut cursor = 0;
        while cursor < tree.nodes.len() {
            let uuid = tree.nodes[cursor].uuid;
            if let Some(kids) = by_parent.get(&uuid) {
                for kid in kids {
                    if tree.index.contains_key(&kid.uuid) {
                        continue;
                    }
                    let position = tree.push((*kid).clone());
                    tree.children[cursor].push(position);
                }
            }
            cursor += 1;
        }

        Some(tree)
    }

    /// Build from a nested view, stamping parent/root pointers.
    pub fn from_nested(nested: &NestedRule) -> Self {
        Self::from_rows(nested.rule.uuid, &decompile_rule(nested))
            .unwrap_or_else(|| Self::single(nested.rule.clone()))
    }

    fn single(rule: Rule) -> Self {
        let mut tree = RuleTree {
            nodes: Vec::new(),
            children: Vec::new(),
            index: HashMap::new(),
        };
        tree.push(rule);
        tree
    }

    fn push(&mut self, rule: Rule) -> usize {
        let position = self.nodes.len();
        self.index.insert(rule.uuid, position);
        self.nodes.push(rule);
        self.children.push(Vec::new());
        position
    }

    pub const ROOT: usize = 0;

    pub fn root(&self) -> &Rule {
        &self.nodes[Self::ROOT]
    }

    pub fn node(&self, position: usize) -> &Rule {
        &self.nodes[position]
    }

    pub fn children(&self, position: usize) -> &[usize] {
        &self.children[position]
    }

    pub fn position(&self, uuid: &Uuid) -> Option<usize> {
        self.index.get(uuid).copied()
    }

    pub fn nodes(&self) -> &[Rule] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_nested(&self) -> NestedRule {
        self.nested_at(Self::ROOT)
    }

    fn nested_at(&self, position: usize) -> NestedRule {
        NestedRule {
            rule: self.nodes[position].clone(),
            children: self.children[position]
                .iter()
                .map(|&child| self.nested_at(child))
                .collect(),
        }
    }
}

/// Group flat rows by `parent_uuid` into the nested view rooted at `root`.
pub fn compile_rule(root: &Rule, rows: &[Rule]) -> NestedRule {
    fn build(rule: &Rule, rows: &[Rule]) -> NestedRule {
        let children = rows
            .iter()
            .filter(|r| r.parent_uuid == Some(rule.uuid) && r.uuid != rule.uuid)
            .map(|child| build(child, rows))
            .collect();
        NestedRule::new(rule.clone(), children)
    }
    build(root, rows)
}

/// Flatten a nested view into insertable rows, root first, with
/// `parent_uuid`/`root_uuid` stamped from the traversal.
pub fn decompile_rule(nested: &NestedRule) -> Vec<Rule> {
    fn walk(node: &NestedRule, parent: Option<Uuid>, root: Uuid, rows: &mut Vec<Rule>) {
        let mut rule = node.rule.clone();
        rule.parent_uuid = parent;
        rule.root_uuid = parent.map(|_| root);
        rows.push(rule);
        for child in &node.children {
            walk(child, Some(node.rule.uuid), root, rows);
        }
    }

    let root = nested.rule.uuid;
    let mut rows = Vec::new();
    walk(nested, None, root, &mut rows);
    rows
}

/// Translate a JSON path (`$.a.b[0]`, `a.b`) into a JSON pointer (`/a/b/0`).
pub fn json_pointer(path: &str) -> String {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix('$')
        .unwrap_or(trimmed)
        .trim_start_matches('.');

    let mut pointer = String::new();
    for segment in body.split('.').filter(|s| !s.is_empty()) {
        let mut rest = segment;
        // `name[0][1]` splits into `name`, `0`, `1`.
        let key_end = rest.find('[').unwrap_or(rest.len());
        let key = &rest[..key_end];
        if !key.is_empty() {
            push_token(&mut pointer, key);
        }
        rest = &rest[key_end..];
        while let Some(open) = rest.find('[') {
            let Some(close) = rest[open..].find(']') else {
                break;
            };
            let token = rest[open + 1..open + close].trim_matches(|c| c == '\'' || c == '"');
            push_token(&mut pointer, token);
            rest = &rest[open + close + 1..];
        }
    }
    pointer
}

fn push_token(pointer: &mut String, token: &str) {
    pointer.push('/');
    pointer.push_str(&token.replace('~', "~0").replace('/', "~1"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Combinator, RuleGroup, RuleKind};

    fn sample() -> NestedRule {
        NestedRule::new(
            Rule::parent(Combinator::And),
            vec![
                NestedRule::leaf(Rule::new(
                    RuleGroup::User,
                    "$.email",
                    RuleKind::String {
                        operator: "is set".into(),
                        value: None,
                    },
                )),
                NestedRule::new(
                    Rule::event("purchase", Combinator::And),
                    vec![NestedRule::leaf(Rule::new(
                        RuleGroup::Event,
                        "$.amount",
                        RuleKind::Number {
                            operator: ">".into(),
                            value: Some(10.0),
                        },
                    ))],
                ),
            ],
        )
    }

    #[test]
    fn test_decompile_stamps_pointers() {
        let nested = sample();
        let rows = decompile_rule(&nested);
        assert_eq!(rows.len(), 4);

        let root = &rows[0];
        assert!(root.parent_uuid.is_none());
        assert!(root.root_uuid.is_none());
        for row in &rows[1..] {
            assert_eq!(row.root_uuid, Some(root.uuid));
        }
        // The event leaf hangs off the event node, not the root.
        assert_eq!(rows[3].parent_uuid, Some(rows[2].uuid));
    }

    #[test]
    fn test_compile_inverts_decompile() {
        let nested = sample();
        let rows = decompile_rule(&nested);
        let compiled = compile_rule(&rows[0], &rows);
        assert_eq!(compiled.children.len(), 2);
        assert_eq!(compiled.children[1].children.len(), 1);
        assert_eq!(decompile_rule(&compiled), rows);
    }

    #[test]
    fn test_arena_adjacency() {
        let nested = sample();
        let tree = RuleTree::from_nested(&nested);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.root().uuid, nested.rule.uuid);
        assert_eq!(tree.children(RuleTree::ROOT).len(), 2);

        let event_pos = tree.position(&nested.children[1].rule.uuid).unwrap();
        assert_eq!(tree.children(event_pos).len(), 1);
        assert_eq!(tree.to_nested(), compile_rule(tree.root(), tree.nodes()));
    }

    #[test]
    fn test_arena_ignores_unreachable_rows() {
        let mut rows = decompile_rule(&sample());
        let mut stray = Rule::parent(Combinator::Or);
        stray.parent_uuid = Some(uuid::Uuid::new_v4());
        rows.push(stray);
        let tree = RuleTree::from_rows(rows[0].uuid, &rows).unwrap();
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_json_pointer() {
        assert_eq!(json_pointer("$"), "");
        assert_eq!(json_pointer("$.email"), "/email");
        assert_eq!(json_pointer("$.data.progress"), "/data/progress");
        assert_eq!(json_pointer("$.items[0].sku"), "/items/0/sku");
        assert_eq!(json_pointer("$['a/b']"), "/a~1b");
        assert_eq!(json_pointer("plan"), "/plan");
    }
}
