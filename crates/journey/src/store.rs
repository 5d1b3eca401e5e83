//! Journey persistence contract and its in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::graph::JourneyGraph;
use crate::types::{Journey, JourneyEdge, JourneyStep, JourneyTransition, JourneyUserState};

#[async_trait]
pub trait JourneyStore: Send + Sync {
    async fn published_journeys(&self, project_id: i64) -> anyhow::Result<Vec<Journey>>;

    /// Journey with its steps and edges, or `None` if it no longer exists.
    async fn graph(&self, journey_id: i64) -> anyhow::Result<Option<JourneyGraph>>;

    async fn user_state(&self, journey_id: i64, user_id: i64) -> anyhow::Result<Option<JourneyUserState>>;

    /// Insert or replace the single pointer for `(journey, user)`.
    async fn save_user_state(&self, state: &JourneyUserState) -> anyhow::Result<()>;

    async fn clear_user_state(&self, journey_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn record_transition(&self, transition: JourneyTransition) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct MemoryJourneyStore {
    journeys: Arc<DashMap<i64, (Journey, Vec<JourneyStep>, Vec<JourneyEdge>)>>,
    states: Arc<DashMap<(i64, i64), JourneyUserState>>,
    transitions: Arc<Mutex<Vec<JourneyTransition>>>,
}

impl MemoryJourneyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_journey(&self, journey: Journey, steps: Vec<JourneyStep>, edges: Vec<JourneyEdge>) {
        self.journeys.insert(journey.id, (journey, steps, edges));
    }

    pub fn set_published(&self, journey_id: i64, published: bool) {
        if let Some(mut entry) = self.journeys.get_mut(&journey_id) {
            entry.0.published = published;
        }
    }

    /// Audit trail of one user in one journey, oldest first.
    pub fn transitions_for(&self, journey_id: i64, user_id: i64) -> Vec<JourneyTransition> {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.journey_id == journey_id && t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn state(&self, journey_id: i64, user_id: i64) -> Option<JourneyUserState> {
        self.states.get(&(journey_id, user_id)).map(|s| s.clone())
    }

    pub fn active_users(&self, journey_id: i64) -> usize {
        self.states.iter().filter(|s| s.key().0 == journey_id).count()
    }
}

#[async_trait]
impl JourneyStore for MemoryJourneyStore {
    async fn published_journeys(&self, project_id: i64) -> anyhow::Result<Vec<Journey>> {
        let mut journeys: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|e| e.value().0.project_id == project_id && e.value().0.published)
            .map(|e| e.value().0.clone())
            .collect();
        journeys.sort_by_key(|j| j.id);
        Ok(journeys)
    }

    async fn graph(&self, journey_id: i64) -> anyhow::Result<Option<JourneyGraph>> {
        Ok(self.journeys.get(&journey_id).map(|entry| {
            let (journey, steps, edges) = entry.value();
            JourneyGraph::build(journey.clone(), steps.clone(), edges)
        }))
    }

    async fn user_state(&self, journey_id: i64, user_id: i64) -> anyhow::Result<Option<JourneyUserState>> {
        Ok(self.state(journey_id, user_id))
    }

    async fn save_user_state(&self, state: &JourneyUserState) -> anyhow::Result<()> {
        self.states.insert((state.journey_id, state.user_id), state.clone());
        Ok(())
    }

    async fn clear_user_state(&self, journey_id: i64, user_id: i64) -> anyhow::Result<()> {
        self.states.remove(&(journey_id, user_id));
        Ok(())
    }

    async fn record_transition(&self, transition: JourneyTransition) -> anyhow::Result<()> {
        self.transitions.lock().push(transition);
        Ok(())
    }
}
