//! End-to-end flows over the in-memory backend: jobs are pulled from the
//! queue and run through the registered handlers like a worker would.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use campaign_core::config::AppConfig;
use campaign_core::types::{AudienceSource, Campaign, CampaignState, Channel, NewEvent, SendState, User};
use campaign_delivery::{ProviderRecord, ProviderThrottle, Template, ThrottleResult};
use campaign_engine::jobs::{send_job, MessageTrigger, CAMPAIGN_SEND_JOB};
use campaign_engine::store::{ListKind, UserList};
use campaign_engine::{create_event, generate_send_list, job_registry, EngineContext, MemoryBackend};
use campaign_journey::types::{Journey, JourneyEdge, JourneyStep, JourneyStepKind};
use campaign_queue::{JobOutcome, JobQueue, MemoryQueue, RetryPolicy, Worker};
use campaign_rules::{Combinator, NestedRule, Rule};

/// Reports every check as over the limit with five seconds to go.
struct SaturatedThrottle;

#[async_trait]
impl ProviderThrottle for SaturatedThrottle {
    async fn throttle_send(&self, _provider_id: i64, _rate_limit: u32) -> anyhow::Result<Option<ThrottleResult>> {
        Ok(Some(ThrottleResult {
            exceeded: true,
            ms_remaining: 5000,
        }))
    }
}

fn worker(ctx: &EngineContext, queue: Arc<MemoryQueue>) -> Worker {
    Worker::new(
        "test-worker".into(),
        queue,
        Arc::new(job_registry(ctx)),
        RetryPolicy::default(),
    )
}

/// Run every job that is ready now, including jobs they enqueue.
async fn drain(queue: &MemoryQueue, worker: &Worker) -> Vec<(String, JobOutcome)> {
    let mut ran = Vec::new();
    for _ in 0..200 {
        let Some(job) = queue.try_next() else { break };
        let name = job.job.name.clone();
        ran.push((name, worker.process(job).await));
    }
    ran
}

fn seed_campaign(backend: &MemoryBackend, id: i64, channel: Channel, rate_limit: Option<u32>) {
    backend.store.insert_provider(ProviderRecord {
        id,
        project_id: 1,
        channel,
        kind: "logger".into(),
        data: json!({}),
        rate_limit,
    });
    backend.store.insert_template(Template {
        id,
        project_id: 1,
        channel,
        data: json!({"body": "hello"}),
    });
    backend.store.insert_campaign(Campaign {
        id,
        project_id: 1,
        name: format!("campaign-{id}"),
        state: CampaignState::Running,
        channel,
        provider_id: id,
        template_id: Some(id),
        audience: AudienceSource::StaticList { list_id: 1 },
        send_at: None,
    });
}

fn user(id: i64) -> User {
    User::new(id, 1, format!("ext-{id}")).with_email(format!("user{id}@example.com"))
}

#[tokio::test]
async fn throttled_send_is_requeued_under_its_job_id() {
    let backend = MemoryBackend::new(AppConfig::default()).with_throttle(Arc::new(SaturatedThrottle));
    let ctx = backend.context();
    seed_campaign(&backend, 1, Channel::Email, Some(1));
    backend.store.insert_user(user(7));
    ctx.sends.insert_pending(1, &[7]).await.unwrap();

    let trigger = MessageTrigger {
        campaign_id: 1,
        user_id: 7,
        event_id: None,
    };
    backend
        .queue
        .enqueue(send_job(Channel::Email, &trigger, 0).unwrap())
        .await
        .unwrap();

    let worker = worker(&ctx, backend.queue.clone());
    let original = backend.queue.try_next().unwrap();
    assert_eq!(worker.process(original).await, JobOutcome::Completed);

    assert_eq!(backend.store.send_state(1, 7), Some(SendState::Throttled));
    let pending = backend.queue.pending_jobs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "email");
    assert_eq!(pending[0].options.job_id.as_deref(), Some("send_1_7"));
    assert!(pending[0].options.delay_ms >= 5000);
    assert!(backend.store.events_for(7).is_empty());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_campaign_finishes_after_requeues() {
    let mut config = AppConfig::default();
    config.dispatch.rate_window_ms = 1000;
    let backend = MemoryBackend::new(config);
    let ctx = backend.context();
    seed_campaign(&backend, 1, Channel::Email, Some(2));
    backend.store.insert_list(
        UserList {
            id: 1,
            project_id: 1,
            name: "everyone".into(),
            kind: ListKind::Static,
        },
        1..=5,
    );
    for id in 1..=5 {
        backend.store.insert_user(user(id));
    }

    let campaign = ctx.campaigns.find_campaign(1).await.unwrap().unwrap();
    assert_eq!(generate_send_list(&ctx, &campaign).await.unwrap(), Some(5));

    let worker = worker(&ctx, backend.queue.clone());
    let first = drain(&backend.queue, &worker).await;
    assert!(first.iter().any(|(name, _)| name == CAMPAIGN_SEND_JOB));
    let states: Vec<SendState> = backend.store.sends_for(1).iter().map(|s| s.state).collect();
    assert_eq!(states.iter().filter(|s| **s == SendState::Sent).count(), 2);
    assert_eq!(states.iter().filter(|s| **s == SendState::Throttled).count(), 3);
    assert_eq!(backend.store.campaign_state(1), Some(CampaignState::Running));

    // Each window lets two more through until everything is out.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(1000)).await;
        drain(&backend.queue, &worker).await;
    }

    assert!(backend
        .store
        .sends_for(1)
        .iter()
        .all(|s| s.state == SendState::Sent));
    assert_eq!(backend.store.campaign_state(1), Some(CampaignState::Finished));
}

#[tokio::test]
async fn event_drives_journey_send_and_feeds_back() {
    let backend = MemoryBackend::new(AppConfig::default());
    let ctx = backend.context();
    seed_campaign(&backend, 1, Channel::Email, None);
    seed_campaign(&backend, 2, Channel::Push, None);
    backend.store.insert_user(user(7));

    let signup = NestedRule::new(
        Rule::parent(Combinator::And),
        vec![NestedRule::leaf(Rule::event("signup", Combinator::And))],
    );
    let emailed = NestedRule::new(
        Rule::parent(Combinator::And),
        vec![NestedRule::leaf(Rule::event("email_sent", Combinator::And))],
    );
    ctx.rules.merge_insert_rules(1, &signup).await.unwrap();
    ctx.rules.merge_insert_rules(1, &emailed).await.unwrap();

    // Journey 1: signup -> email campaign 1 -> exit.
    backend.journeys.insert_journey(
        Journey {
            id: 1,
            project_id: 1,
            name: "welcome".into(),
            published: true,
            tags: vec![],
        },
        vec![
            JourneyStep::new(1, 1, JourneyStepKind::Entrance { rule_uuid: signup.rule.uuid }),
            JourneyStep::new(2, 1, JourneyStepKind::Action { campaign_id: 1 }),
            JourneyStep::new(3, 1, JourneyStepKind::Exit),
        ],
        vec![JourneyEdge::new(1, 2), JourneyEdge::new(2, 3)],
    );
    // Journey 2: email_sent -> push campaign 2.
    backend.journeys.insert_journey(
        Journey {
            id: 2,
            project_id: 1,
            name: "follow-up".into(),
            published: true,
            tags: vec![],
        },
        vec![
            JourneyStep::new(10, 2, JourneyStepKind::Entrance { rule_uuid: emailed.rule.uuid }),
            JourneyStep::new(11, 2, JourneyStepKind::Action { campaign_id: 2 }),
        ],
        vec![JourneyEdge::new(10, 11)],
    );

    create_event(&ctx, &user(7), NewEvent::new("signup", json!({"source": "web"})))
        .await
        .unwrap();
    let worker = worker(&ctx, backend.queue.clone());
    let ran = drain(&backend.queue, &worker).await;
    assert!(ran.iter().all(|(_, outcome)| *outcome == JobOutcome::Completed));

    assert_eq!(backend.store.send_state(1, 7), Some(SendState::Sent));
    assert_eq!(backend.store.send_state(2, 7), Some(SendState::Sent));
    let names: Vec<String> = backend.store.events_for(7).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["signup", "email_sent", "push_sent"]);

    assert!(backend.journeys.state(1, 7).is_none());
    assert!(backend.journeys.state(2, 7).is_none());
    assert_eq!(backend.journeys.transitions_for(1, 7).len(), 4);
}
