use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A journey definition. Steps and edges live in its `JourneyGraph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single step within a journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyStep {
    pub id: i64,
    pub journey_id: i64,
    #[serde(flatten)]
    pub kind: JourneyStepKind,
    /// Editor layout, ignored by the runner.
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

impl JourneyStep {
    pub fn new(id: i64, journey_id: i64, kind: JourneyStepKind) -> Self {
        Self {
            id,
            journey_id,
            kind,
            x: 0.0,
            y: 0.0,
        }
    }
}

/// What a step does, with its per-type payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum JourneyStepKind {
    /// Users enter when the rule root flips to true on an event.
    Entrance { rule_uuid: Uuid },
    /// Branches on the rule root's truth value for the user.
    Gate { rule_uuid: Uuid },
    /// Branches on the exact value found at `path` in the user's facts.
    Map { path: String },
    /// Schedules a campaign send for the user.
    Action { campaign_id: i64 },
    /// Holds the user for a fixed time.
    Delay { minutes: u64 },
    Exit,
}

impl JourneyStepKind {
    pub fn label(&self) -> &'static str {
        match self {
            JourneyStepKind::Entrance { .. } => "entrance",
            JourneyStepKind::Gate { .. } => "gate",
            JourneyStepKind::Map { .. } => "map",
            JourneyStepKind::Action { .. } => "action",
            JourneyStepKind::Delay { .. } => "delay",
            JourneyStepKind::Exit => "exit",
        }
    }
}

/// Branch-selection data on a step → child edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EdgeData {
    /// Taken by a map step when the fact value equals `value`.
    Match { value: serde_json::Value },
    /// Taken by a gate step when its rule result equals `passed`.
    Gate { passed: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyEdge {
    pub step_id: i64,
    pub child_id: i64,
    #[serde(default)]
    pub data: Option<EdgeData>,
}

impl JourneyEdge {
    pub fn new(step_id: i64, child_id: i64) -> Self {
        Self {
            step_id,
            child_id,
            data: None,
        }
    }

    pub fn matching(step_id: i64, child_id: i64, value: serde_json::Value) -> Self {
        Self {
            step_id,
            child_id,
            data: Some(EdgeData::Match { value }),
        }
    }

    pub fn gate(step_id: i64, child_id: i64, passed: bool) -> Self {
        Self {
            step_id,
            child_id,
            data: Some(EdgeData::Gate { passed }),
        }
    }
}

/// Where a user currently is in one journey. The step is not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyUserState {
    pub journey_id: i64,
    pub user_id: i64,
    pub step_id: i64,
    pub entered_step_at: DateTime<Utc>,
}

/// One traversed edge in a user's audit trail. `None` marks entry or exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyTransition {
    pub journey_id: i64,
    pub user_id: i64,
    pub from_step: Option<i64>,
    pub to_step: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Payload of the `journey_delay` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyDelayTrigger {
    pub journey_id: i64,
    pub user_id: i64,
}
