use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use campaign_rules::tree::json_pointer;

use crate::graph::JourneyGraph;
use crate::types::{EdgeData, JourneyStep, JourneyStepKind};

/// Longest delay honoured, about a century.
const MAX_DELAY_MINUTES: u64 = 60 * 24 * 365 * 100;

/// What resolving the step a user is at produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Move to this child step.
    Advance { next_step: i64 },
    /// Stay put until an event or the given time.
    Wait { until: Option<DateTime<Utc>> },
    /// Leave the journey.
    Complete,
}

/// Inputs a step may depend on beyond the graph itself.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    /// The user's flattened facts.
    pub user: &'a Value,
    /// The gate's rule result, when the step is a gate.
    pub gate_passed: Option<bool>,
    pub entered_step_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Resolves single journey steps. Side effects (actions, gate rule
/// checks, persistence) belong to the runner.
#[derive(Debug, Clone, Default)]
pub struct JourneyEvaluator;

impl JourneyEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, graph: &JourneyGraph, step: &JourneyStep, ctx: &StepContext<'_>) -> StepOutcome {
        let outcome = match &step.kind {
            JourneyStepKind::Entrance { .. } | JourneyStepKind::Action { .. } => {
                self.follow_first(graph, step)
            }
            JourneyStepKind::Gate { .. } => match ctx.gate_passed {
                Some(passed) => self.select(graph, step, |data| {
                    matches!(data, Some(EdgeData::Gate { passed: p }) if *p == passed)
                }),
                None => StepOutcome::Wait { until: None },
            },
            JourneyStepKind::Map { path } => {
                let actual = ctx.user.pointer(&json_pointer(path)).unwrap_or(&Value::Null);
                self.select(graph, step, |data| {
                    matches!(data, Some(EdgeData::Match { value }) if values_match(actual, value))
                })
            }
            JourneyStepKind::Delay { minutes } => {
                let minutes = (*minutes).min(MAX_DELAY_MINUTES) as i64;
                let until = ctx.entered_step_at + Duration::minutes(minutes);
                if ctx.now >= until {
                    self.follow_first(graph, step)
                } else {
                    StepOutcome::Wait { until: Some(until) }
                }
            }
            JourneyStepKind::Exit => StepOutcome::Complete,
        };

        debug!(step_id = step.id, kind = step.kind.label(), ?outcome, "Resolved journey step");
        outcome
    }

    /// Unconditional advance; a step without children is terminal.
    fn follow_first(&self, graph: &JourneyGraph, step: &JourneyStep) -> StepOutcome {
        match graph.first_child(step.id) {
            Some(child) => StepOutcome::Advance { next_step: child.id },
            None => StepOutcome::Complete,
        }
    }

    /// Branch on edge data: exactly one matching edge advances; none or
    /// several hold the user where they are.
    fn select(
        &self,
        graph: &JourneyGraph,
        step: &JourneyStep,
        matches: impl Fn(Option<&EdgeData>) -> bool,
    ) -> StepOutcome {
        let hits: Vec<i64> = graph
            .children(step.id)
            .into_iter()
            .filter(|(_, data)| matches(*data))
            .map(|(child, _)| child.id)
            .collect();
        match hits.as_slice() {
            [only] => StepOutcome::Advance { next_step: *only },
            _ => StepOutcome::Wait { until: None },
        }
    }
}

/// Exact match. Numbers compare by value so `20` equals `20.0`.
fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => a.as_f64() == e.as_f64(),
        _ => actual == expected,
    }
}
