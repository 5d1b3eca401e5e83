//! Rule rows as stored: flat, with parent/root pointers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which part of the fact set a node reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleGroup {
    User,
    Event,
    Parent,
}

/// How a wrapper combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    And,
    Or,
    None,
    Xor,
}

impl Combinator {
    /// `and`: all true. `or`: any true. `none`: no true. `xor`: exactly one true.
    pub fn apply<I: IntoIterator<Item = bool>>(self, results: I) -> bool {
        let mut total = 0usize;
        let mut truthy = 0usize;
        for result in results {
            total += 1;
            if result {
                truthy += 1;
            }
        }
        match self {
            Combinator::And => truthy == total,
            Combinator::Or => truthy > 0,
            Combinator::None => truthy == 0,
            Combinator::Xor => truthy == 1,
        }
    }
}

/// Node payload, tagged by `type`. Leaf values are typed per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Wrapper {
        operator: Combinator,
        /// Event name for `group = event` wrappers.
        #[serde(default)]
        value: Option<String>,
    },
    String {
        operator: String,
        #[serde(default)]
        value: Option<String>,
    },
    Number {
        operator: String,
        #[serde(default)]
        value: Option<f64>,
    },
    Boolean {
        operator: String,
        #[serde(default)]
        value: Option<bool>,
    },
    Date {
        operator: String,
        #[serde(default)]
        value: Option<String>,
    },
    Array {
        operator: String,
        #[serde(default)]
        value: Option<Value>,
    },
}

/// Leaf value types, the first key of the operator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Date,
    Array,
}

impl RuleKind {
    pub fn is_wrapper(&self) -> bool {
        matches!(self, RuleKind::Wrapper { .. })
    }

    /// `(value type, operator, expected value)` for a leaf; `None` for wrappers.
    pub fn leaf(&self) -> Option<(ValueType, &str, Value)> {
        match self {
            RuleKind::Wrapper { .. } => None,
            RuleKind::String { operator, value } => Some((
                ValueType::String,
                operator.as_str(),
                value.clone().map(Value::from).unwrap_or(Value::Null),
            )),
            RuleKind::Number { operator, value } => Some((
                ValueType::Number,
                operator.as_str(),
                value.map(Value::from).unwrap_or(Value::Null),
            )),
            RuleKind::Boolean { operator, value } => Some((
                ValueType::Boolean,
                operator.as_str(),
                value.map(Value::from).unwrap_or(Value::Null),
            )),
            RuleKind::Date { operator, value } => Some((
                ValueType::Date,
                operator.as_str(),
                value.clone().map(Value::from).unwrap_or(Value::Null),
            )),
            RuleKind::Array { operator, value } => Some((
                ValueType::Array,
                operator.as_str(),
                value.clone().unwrap_or(Value::Null),
            )),
        }
    }
}

fn default_path() -> String {
    "$".to_string()
}

/// One stored rule node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Row id, assigned by the store. Zero before insertion.
    #[serde(default)]
    pub id: i64,
    pub uuid: Uuid,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    #[serde(default)]
    pub root_uuid: Option<Uuid>,
    #[serde(default)]
    pub project_id: i64,
    pub group: RuleGroup,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

impl Rule {
    pub fn new(group: RuleGroup, path: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            root_uuid: None,
            project_id: 0,
            group,
            path: path.into(),
            kind,
        }
    }

    /// A root or nested combinator over its children.
    pub fn parent(operator: Combinator) -> Self {
        Self::new(
            RuleGroup::Parent,
            "$",
            RuleKind::Wrapper {
                operator,
                value: None,
            },
        )
    }

    /// An event node matching events named `name`.
    pub fn event(name: impl Into<String>, operator: Combinator) -> Self {
        Self::new(
            RuleGroup::Event,
            "$.name",
            RuleKind::Wrapper {
                operator,
                value: Some(name.into()),
            },
        )
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_none()
    }

    /// Event name when this node is an event wrapper.
    pub fn event_name(&self) -> Option<&str> {
        match (&self.group, &self.kind) {
            (RuleGroup::Event, RuleKind::Wrapper { value, .. }) => value.as_deref(),
            _ => None,
        }
    }

    pub fn is_event_node(&self) -> bool {
        self.group == RuleGroup::Event && self.kind.is_wrapper()
    }

    /// Field equality ignoring the row id.
    pub fn same_content(&self, other: &Rule) -> bool {
        self.uuid == other.uuid
            && self.parent_uuid == other.parent_uuid
            && self.root_uuid == other.root_uuid
            && self.project_id == other.project_id
            && self.group == other.group
            && self.path == other.path
            && self.kind == other.kind
    }
}
