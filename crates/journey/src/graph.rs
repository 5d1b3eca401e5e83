//! Journey graph as an arena: steps in a flat vector, edges resolved to
//! positions once per load.

use std::collections::HashMap;

use crate::types::{EdgeData, Journey, JourneyEdge, JourneyStep, JourneyStepKind};

#[derive(Debug, Clone)]
struct Edge {
    child: usize,
    data: Option<EdgeData>,
}

#[derive(Debug, Clone)]
pub struct JourneyGraph {
    pub journey: Journey,
    steps: Vec<JourneyStep>,
    index: HashMap<i64, usize>,
    children: Vec<Vec<Edge>>,
}

impl JourneyGraph {
    /// Build the arena. Edges naming unknown steps are dropped; edge order
    /// is kept, so "first child" is the first edge authored.
    pub fn build(journey: Journey, steps: Vec<JourneyStep>, edges: &[JourneyEdge]) -> Self {
        let index: HashMap<i64, usize> = steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.id, position))
            .collect();

        let mut children: Vec<Vec<Edge>> = vec![Vec::new(); steps.len()];
        for edge in edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.step_id), index.get(&edge.child_id)) {
                children[from].push(Edge {
                    child: to,
                    data: edge.data.clone(),
                });
            }
        }

        Self {
            journey,
            steps,
            index,
            children,
        }
    }

    pub fn id(&self) -> i64 {
        self.journey.id
    }

    pub fn step(&self, step_id: i64) -> Option<&JourneyStep> {
        self.index.get(&step_id).map(|&position| &self.steps[position])
    }

    pub fn steps(&self) -> &[JourneyStep] {
        &self.steps
    }

    /// Outgoing edges of `step_id` as (child step, edge data).
    pub fn children(&self, step_id: i64) -> Vec<(&JourneyStep, Option<&EdgeData>)> {
        match self.index.get(&step_id) {
            Some(&position) => self.children[position]
                .iter()
                .map(|edge| (&self.steps[edge.child], edge.data.as_ref()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn first_child(&self, step_id: i64) -> Option<&JourneyStep> {
        self.children(step_id).first().map(|(step, _)| *step)
    }

    pub fn entrances(&self) -> impl Iterator<Item = &JourneyStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.kind, JourneyStepKind::Entrance { .. }))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
