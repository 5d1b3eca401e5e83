use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use campaign_core::config::JourneyConfig;
use campaign_core::types::{User, UserEvent};
use campaign_queue::{Job, JobQueue};
use campaign_rules::{RuleOrchestrator, RuleResults};

use crate::evaluator::{JourneyEvaluator, StepContext, StepOutcome};
use crate::graph::JourneyGraph;
use crate::store::JourneyStore;
use crate::types::{JourneyDelayTrigger, JourneyStepKind, JourneyTransition, JourneyUserState};

/// Job that resumes a user parked on a delay step.
pub const JOURNEY_DELAY_JOB: &str = "journey_delay";

/// Side effect of an action step.
#[async_trait]
pub trait ActionTrigger: Send + Sync {
    /// Schedule a send of `campaign_id` to `user`.
    async fn trigger(&self, user: &User, campaign_id: i64) -> anyhow::Result<()>;
}

/// Result of processing one journey for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JourneyAdvance {
    pub journey_id: i64,
    /// The user entered the journey during this call.
    pub entered: bool,
    /// Step the user now rests at; `None` once they have left.
    pub step_id: Option<i64>,
    /// Edges traversed, entry and exit included.
    pub transitions: usize,
}

/// Advances users through journey graphs. All work for one
/// `(journey, user)` pair runs under that pair's mutex.
pub struct JourneyRunner {
    store: Arc<dyn JourneyStore>,
    rules: Arc<RuleOrchestrator>,
    actions: Arc<dyn ActionTrigger>,
    queue: Arc<dyn JobQueue>,
    evaluator: JourneyEvaluator,
    config: JourneyConfig,
    locks: DashMap<(i64, i64), Arc<Mutex<()>>>,
}

impl std::fmt::Debug for JourneyRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyRunner")
            .field("config", &self.config)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl JourneyRunner {
    pub fn new(
        store: Arc<dyn JourneyStore>,
        rules: Arc<RuleOrchestrator>,
        actions: Arc<dyn ActionTrigger>,
        queue: Arc<dyn JobQueue>,
        config: JourneyConfig,
    ) -> Self {
        Self {
            store,
            rules,
            actions,
            queue,
            evaluator: JourneyEvaluator::new(),
            config,
            locks: DashMap::new(),
        }
    }

    /// React to an event: recompute the event's rules, then enter and
    /// advance the user across every published journey.
    pub async fn update_users_journeys(
        &self,
        user: &User,
        event: &UserEvent,
    ) -> anyhow::Result<Vec<JourneyAdvance>> {
        let results = self.rules.matching_rules_for_event(user, event).await?;
        self.apply_rule_results(user, &results).await
    }

    /// Same as `update_users_journeys` with the event's rule results
    /// already computed.
    pub async fn apply_rule_results(
        &self,
        user: &User,
        results: &RuleResults,
    ) -> anyhow::Result<Vec<JourneyAdvance>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let journeys = self.store.published_journeys(user.project_id).await?;
        let now = Utc::now();
        let mut advances = Vec::new();
        for journey in journeys {
            if let Some(advance) = self.process(journey.id, user, Some(results), now).await? {
                advances.push(advance);
            }
        }
        Ok(advances)
    }

    /// Resume a user already in `journey_id` without a new event.
    pub async fn advance(&self, journey_id: i64, user: &User) -> anyhow::Result<Option<JourneyAdvance>> {
        self.advance_at(journey_id, user, Utc::now()).await
    }

    /// `advance` against an explicit clock.
    pub async fn advance_at(
        &self,
        journey_id: i64,
        user: &User,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<JourneyAdvance>> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.process(journey_id, user, None, now).await
    }

    async fn process(
        &self,
        journey_id: i64,
        user: &User,
        results: Option<&RuleResults>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<JourneyAdvance>> {
        let key = (journey_id, user.id);
        let lock = self.locks.entry(key).or_default().clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.process_locked(journey_id, user, results, now).await
        };
        drop(lock);
        self.locks.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        outcome
    }

    async fn process_locked(
        &self,
        journey_id: i64,
        user: &User,
        results: Option<&RuleResults>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<JourneyAdvance>> {
        let Some(graph) = self.store.graph(journey_id).await? else {
            return Ok(None);
        };
        if !graph.journey.published {
            debug!(journey_id, "Journey not published, skipping");
            return Ok(None);
        }

        let mut advance = JourneyAdvance {
            journey_id,
            entered: false,
            step_id: None,
            transitions: 0,
        };

        let mut state = match self.store.user_state(journey_id, user.id).await? {
            Some(state) => state,
            None => {
                let Some(entrance) = results.and_then(|r| entrance_for(&graph, r)) else {
                    return Ok(None);
                };
                let state = JourneyUserState {
                    journey_id,
                    user_id: user.id,
                    step_id: entrance,
                    entered_step_at: now,
                };
                self.move_to(&state, None).await?;
                info!(journey_id, user_id = user.id, step_id = entrance, "User entered journey");
                metrics::counter!("journey.entered").increment(1);
                advance.entered = true;
                advance.transitions += 1;
                state
            }
        };

        let facts = user.flatten();
        for _ in 0..self.config.max_steps_per_advance.max(1) {
            let Some(step) = graph.step(state.step_id).cloned() else {
                warn!(journey_id, user_id = user.id, step_id = state.step_id, "User at unknown step, clearing");
                self.store.clear_user_state(journey_id, user.id).await?;
                return Ok(Some(advance));
            };

            let gate_passed = match &step.kind {
                JourneyStepKind::Gate { rule_uuid } => {
                    Some(self.rules.check_root_rule(*rule_uuid, user).await?)
                }
                _ => None,
            };
            if let JourneyStepKind::Action { campaign_id } = &step.kind {
                self.actions.trigger(user, *campaign_id).await?;
                metrics::counter!("journey.actions").increment(1);
            }

            let ctx = StepContext {
                user: &facts,
                gate_passed,
                entered_step_at: state.entered_step_at,
                now,
            };
            match self.evaluator.resolve(&graph, &step, &ctx) {
                StepOutcome::Advance { next_step } => {
                    state.step_id = next_step;
                    state.entered_step_at = now;
                    self.move_to(&state, Some(step.id)).await?;
                    advance.transitions += 1;
                }
                StepOutcome::Wait { until } => {
                    if let Some(until) = until {
                        self.schedule_delay(journey_id, user.id, until, now).await?;
                    }
                    advance.step_id = Some(state.step_id);
                    return Ok(Some(advance));
                }
                StepOutcome::Complete => {
                    self.record(journey_id, user.id, Some(step.id), None, now).await?;
                    self.store.clear_user_state(journey_id, user.id).await?;
                    info!(journey_id, user_id = user.id, step_id = step.id, "User left journey");
                    metrics::counter!("journey.completed").increment(1);
                    advance.transitions += 1;
                    return Ok(Some(advance));
                }
            }
        }

        warn!(
            journey_id,
            user_id = user.id,
            step_id = state.step_id,
            limit = self.config.max_steps_per_advance,
            "Step limit reached, parking user"
        );
        advance.step_id = Some(state.step_id);
        Ok(Some(advance))
    }

    /// Persist the user at `state.step_id` with the edge that led there.
    /// The pointer is written before the next step runs, so a failed
    /// step is retried from where it stopped instead of from the entrance.
    async fn move_to(&self, state: &JourneyUserState, from_step: Option<i64>) -> anyhow::Result<()> {
        self.store.save_user_state(state).await?;
        self.record(
            state.journey_id,
            state.user_id,
            from_step,
            Some(state.step_id),
            state.entered_step_at,
        )
        .await
    }

    async fn record(
        &self,
        journey_id: i64,
        user_id: i64,
        from_step: Option<i64>,
        to_step: Option<i64>,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .record_transition(JourneyTransition {
                journey_id,
                user_id,
                from_step,
                to_step,
                at,
            })
            .await
    }

    async fn schedule_delay(
        &self,
        journey_id: i64,
        user_id: i64,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let delay_ms = (until - now).num_milliseconds().max(0) as u64;
        let job = Job::from_payload(JOURNEY_DELAY_JOB, &JourneyDelayTrigger { journey_id, user_id })?
            .with_delay(delay_ms)
            .with_job_id(format!("journey_delay_{journey_id}_{user_id}"));
        self.queue.enqueue(job).await?;
        debug!(journey_id, user_id, delay_ms, "Scheduled journey delay");
        Ok(())
    }
}

/// First entrance whose rule root just flipped to true.
fn entrance_for(graph: &JourneyGraph, results: &RuleResults) -> Option<i64> {
    graph
        .entrances()
        .find(|step| match &step.kind {
            JourneyStepKind::Entrance { rule_uuid } => results.is_success(rule_uuid),
            _ => false,
        })
        .map(|step| step.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJourneyStore;
    use crate::types::{Journey, JourneyEdge, JourneyStep};
    use campaign_queue::MemoryQueue;
    use campaign_rules::{
        Combinator, MemoryEvaluationCache, MemoryRuleStore, NestedRule, Rule, RuleGroup, RuleKind,
    };
    use chrono::Duration;
    use serde_json::{json, Value};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingActions {
        sent: parking_lot::Mutex<Vec<(i64, i64)>>,
        /// Campaign whose next trigger fails.
        fail_once: parking_lot::Mutex<Option<i64>>,
    }

    #[async_trait]
    impl ActionTrigger for RecordingActions {
        async fn trigger(&self, user: &User, campaign_id: i64) -> anyhow::Result<()> {
            let mut fail = self.fail_once.lock();
            if *fail == Some(campaign_id) {
                *fail = None;
                anyhow::bail!("campaign {campaign_id} unavailable");
            }
            drop(fail);
            self.sent.lock().push((user.id, campaign_id));
            Ok(())
        }
    }

    struct Harness {
        runner: Arc<JourneyRunner>,
        rules: Arc<RuleOrchestrator>,
        store: MemoryJourneyStore,
        actions: Arc<RecordingActions>,
        queue: Arc<MemoryQueue>,
    }

    fn harness(config: JourneyConfig) -> Harness {
        let rules = Arc::new(RuleOrchestrator::new(
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryEvaluationCache::new()),
        ));
        let store = MemoryJourneyStore::new();
        let actions = Arc::new(RecordingActions::default());
        let queue = Arc::new(MemoryQueue::default());
        let runner = Arc::new(JourneyRunner::new(
            Arc::new(store.clone()),
            rules.clone(),
            actions.clone(),
            queue.clone(),
            config,
        ));
        Harness {
            runner,
            rules,
            store,
            actions,
            queue,
        }
    }

    fn journey(id: i64) -> Journey {
        Journey {
            id,
            project_id: 1,
            name: format!("journey-{id}"),
            published: true,
            tags: vec![],
        }
    }

    fn user(data: Value) -> User {
        User::new(7, 1, "ext-7").with_email("a@b.co").with_data(data)
    }

    fn event(name: &str) -> UserEvent {
        UserEvent {
            id: 1,
            project_id: 1,
            user_id: 7,
            name: name.into(),
            data: json!({}),
            created_at: Utc::now(),
        }
    }

    /// Root that turns true once the user sends `name`.
    async fn event_rule(rules: &RuleOrchestrator, name: &str) -> Uuid {
        let tree = NestedRule::new(
            Rule::parent(Combinator::And),
            vec![NestedRule::leaf(Rule::event(name, Combinator::And))],
        );
        rules.merge_insert_rules(1, &tree).await.unwrap();
        tree.rule.uuid
    }

    async fn user_rule(rules: &RuleOrchestrator, path: &str, op: &str, value: Option<&str>) -> Uuid {
        let tree = NestedRule::new(
            Rule::parent(Combinator::And),
            vec![NestedRule::leaf(Rule::new(
                RuleGroup::User,
                path,
                RuleKind::String {
                    operator: op.into(),
                    value: value.map(str::to_string),
                },
            ))],
        );
        rules.merge_insert_rules(1, &tree).await.unwrap();
        tree.rule.uuid
    }

    #[tokio::test]
    async fn test_entrance_gate_action_exit() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        let has_email = user_rule(&h.rules, "$.email", "is set", None).await;

        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Gate { rule_uuid: has_email }),
                JourneyStep::new(3, 1, JourneyStepKind::Action { campaign_id: 40 }),
                JourneyStep::new(4, 1, JourneyStepKind::Exit),
            ],
            vec![
                JourneyEdge::new(1, 2),
                JourneyEdge::gate(2, 3, true),
                JourneyEdge::gate(2, 4, false),
                JourneyEdge::new(3, 4),
            ],
        );

        let u = user(json!({}));
        let advances = h.runner.update_users_journeys(&u, &event("signup")).await.unwrap();
        assert_eq!(
            advances,
            vec![JourneyAdvance {
                journey_id: 1,
                entered: true,
                step_id: None,
                transitions: 5,
            }]
        );
        assert_eq!(*h.actions.sent.lock(), vec![(7, 40)]);
        assert!(h.store.state(1, 7).is_none());

        let trail: Vec<(Option<i64>, Option<i64>)> = h
            .store
            .transitions_for(1, 7)
            .iter()
            .map(|t| (t.from_step, t.to_step))
            .collect();
        assert_eq!(
            trail,
            vec![
                (None, Some(1)),
                (Some(1), Some(2)),
                (Some(2), Some(3)),
                (Some(3), Some(4)),
                (Some(4), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_gate_equality_rules() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        let equals = user_rule(&h.rules, "$.email", "=", Some("a@b.co")).await;
        let not_equals = user_rule(&h.rules, "$.email", "!=", Some("notequal@test.com")).await;
        let u = user(json!({}));

        for (journey_id, gate_rule) in [(1, equals), (2, not_equals)] {
            h.store.insert_journey(
                journey(journey_id),
                vec![
                    JourneyStep::new(1, journey_id, JourneyStepKind::Entrance { rule_uuid: entry }),
                    JourneyStep::new(2, journey_id, JourneyStepKind::Gate { rule_uuid: gate_rule }),
                    JourneyStep::new(3, journey_id, JourneyStepKind::Action { campaign_id: journey_id * 10 }),
                ],
                vec![JourneyEdge::new(1, 2), JourneyEdge::gate(2, 3, true)],
            );
        }

        h.runner.update_users_journeys(&u, &event("signup")).await.unwrap();
        assert_eq!(*h.actions.sent.lock(), vec![(7, 10), (7, 20)]);
    }

    #[tokio::test]
    async fn test_map_waits_for_matching_value() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "progress").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Map { path: "progress".into() }),
                JourneyStep::new(10, 1, JourneyStepKind::Action { campaign_id: 100 }),
                JourneyStep::new(20, 1, JourneyStepKind::Action { campaign_id: 200 }),
                JourneyStep::new(30, 1, JourneyStepKind::Action { campaign_id: 300 }),
            ],
            vec![
                JourneyEdge::new(1, 2),
                JourneyEdge::matching(2, 10, json!(10)),
                JourneyEdge::matching(2, 20, json!(20)),
                JourneyEdge::matching(2, 30, json!(30)),
            ],
        );

        let stuck = user(json!({"progress": 25}));
        let advances = h.runner.update_users_journeys(&stuck, &event("progress")).await.unwrap();
        assert_eq!(advances[0].step_id, Some(2));
        assert!(h.actions.sent.lock().is_empty());

        let moved = user(json!({"progress": 30}));
        let advance = h.runner.advance(1, &moved).await.unwrap().unwrap();
        assert!(!advance.entered);
        assert_eq!(advance.step_id, None);
        assert_eq!(*h.actions.sent.lock(), vec![(7, 300)]);
    }

    #[tokio::test]
    async fn test_delay_schedules_job_and_resumes() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Delay { minutes: 30 }),
                JourneyStep::new(3, 1, JourneyStepKind::Action { campaign_id: 9 }),
            ],
            vec![JourneyEdge::new(1, 2), JourneyEdge::new(2, 3)],
        );

        let u = user(json!({}));
        h.runner.update_users_journeys(&u, &event("signup")).await.unwrap();
        assert_eq!(h.store.state(1, 7).unwrap().step_id, 2);

        let jobs = h.queue.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, JOURNEY_DELAY_JOB);
        assert_eq!(jobs[0].options.job_id.as_deref(), Some("journey_delay_1_7"));
        assert!(jobs[0].options.delay_ms > 29 * 60 * 1000);

        // A second event while parked does not duplicate the job.
        h.runner.update_users_journeys(&u, &event("signup")).await.unwrap();
        assert_eq!(h.queue.len(), 1);

        let entered = h.store.state(1, 7).unwrap().entered_step_at;
        let early = h.runner.advance_at(1, &u, entered + Duration::minutes(10)).await.unwrap();
        assert_eq!(early.unwrap().step_id, Some(2));
        assert!(h.actions.sent.lock().is_empty());

        let due = h.runner.advance_at(1, &u, entered + Duration::minutes(30)).await.unwrap();
        assert_eq!(due.unwrap().step_id, None);
        assert_eq!(*h.actions.sent.lock(), vec![(7, 9)]);
    }

    #[tokio::test]
    async fn test_concurrent_events_enter_once() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Delay { minutes: 60 }),
            ],
            vec![JourneyEdge::new(1, 2)],
        );

        let u = user(json!({}));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let runner = h.runner.clone();
            let u = u.clone();
            handles.push(tokio::spawn(async move {
                runner.update_users_journeys(&u, &event("signup")).await.unwrap()
            }));
        }
        let mut entries = 0;
        for handle in handles {
            entries += handle.await.unwrap().iter().filter(|a| a.entered).count();
        }

        assert_eq!(entries, 1);
        let entry_rows = h
            .store
            .transitions_for(1, 7)
            .into_iter()
            .filter(|t| t.from_step.is_none())
            .count();
        assert_eq!(entry_rows, 1);
    }

    #[tokio::test]
    async fn test_failed_action_resumes_without_reentry() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Action { campaign_id: 40 }),
                JourneyStep::new(3, 1, JourneyStepKind::Action { campaign_id: 41 }),
                JourneyStep::new(4, 1, JourneyStepKind::Exit),
            ],
            vec![JourneyEdge::new(1, 2), JourneyEdge::new(2, 3), JourneyEdge::new(3, 4)],
        );
        *h.actions.fail_once.lock() = Some(41);

        let u = user(json!({}));
        assert!(h.runner.update_users_journeys(&u, &event("signup")).await.is_err());
        assert_eq!(h.store.state(1, 7).unwrap().step_id, 3);
        assert_eq!(*h.actions.sent.lock(), vec![(7, 40)]);

        // The job retries the same event.
        let advances = h.runner.update_users_journeys(&u, &event("signup")).await.unwrap();
        assert!(!advances[0].entered);
        assert_eq!(advances[0].step_id, None);
        assert_eq!(*h.actions.sent.lock(), vec![(7, 40), (7, 41)]);
        assert!(h.store.state(1, 7).is_none());

        let trail: Vec<(Option<i64>, Option<i64>)> = h
            .store
            .transitions_for(1, 7)
            .iter()
            .map(|t| (t.from_step, t.to_step))
            .collect();
        assert_eq!(
            trail,
            vec![
                (None, Some(1)),
                (Some(1), Some(2)),
                (Some(2), Some(3)),
                (Some(3), Some(4)),
                (Some(4), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_cycle_bounded_by_step_limit() {
        let h = harness(JourneyConfig {
            enabled: true,
            max_steps_per_advance: 5,
        });
        let entry = event_rule(&h.rules, "loop").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Action { campaign_id: 1 }),
                JourneyStep::new(3, 1, JourneyStepKind::Action { campaign_id: 2 }),
            ],
            vec![JourneyEdge::new(1, 2), JourneyEdge::new(2, 3), JourneyEdge::new(3, 2)],
        );

        let u = user(json!({}));
        let advances = h.runner.update_users_journeys(&u, &event("loop")).await.unwrap();
        assert!(advances[0].step_id.is_some());
        assert_eq!(h.actions.sent.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_unpublished_and_disabled() {
        let h = harness(JourneyConfig::default());
        let entry = event_rule(&h.rules, "signup").await;
        h.store.insert_journey(
            journey(1),
            vec![
                JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: entry }),
                JourneyStep::new(2, 1, JourneyStepKind::Delay { minutes: 5 }),
            ],
            vec![JourneyEdge::new(1, 2)],
        );
        h.store.set_published(1, false);

        let u = user(json!({}));
        assert!(h.runner.update_users_journeys(&u, &event("signup")).await.unwrap().is_empty());

        let disabled = harness(JourneyConfig {
            enabled: false,
            max_steps_per_advance: 64,
        });
        assert!(disabled
            .runner
            .apply_rule_results(&u, &RuleResults::default())
            .await
            .unwrap()
            .is_empty());
    }
}
