//! Job payloads, constructors and the handlers registered for each job
//! name.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use campaign_core::types::{Channel, NewEvent};
use campaign_journey::types::JourneyDelayTrigger;
use campaign_journey::JOURNEY_DELAY_JOB;
use campaign_queue::{Job, JobError, JobHandler, JobRegistry};

use crate::context::EngineContext;
use crate::{dispatcher, events, generator};

pub const CAMPAIGN_GENERATE_LIST_JOB: &str = "campaign_generate_list";
pub const CAMPAIGN_SEND_JOB: &str = "campaign_send";
pub const EVENT_POST_JOB: &str = "event_post";

/// Payload of campaign-wide jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignJob {
    pub campaign_id: i64,
}

/// Payload of the per-channel send jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTrigger {
    pub campaign_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub event_id: Option<i64>,
}

/// Payload of `event_post`. `event_id` is set when the event is already
/// stored; otherwise the handler stores `event` under `key`, so every
/// attempt of the job resolves to the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPostTrigger {
    pub project_id: i64,
    pub user_id: i64,
    pub event: NewEvent,
    #[serde(default)]
    pub event_id: Option<i64>,
    pub key: Uuid,
}

impl EventPostTrigger {
    /// An event not stored yet, with a fresh idempotency key.
    pub fn new(project_id: i64, user_id: i64, event: NewEvent) -> Self {
        Self {
            project_id,
            user_id,
            event,
            event_id: None,
            key: Uuid::new_v4(),
        }
    }
}

pub fn send_job_id(campaign_id: i64, user_id: i64) -> String {
    format!("send_{campaign_id}_{user_id}")
}

/// Per-user send job, named after the channel.
pub fn send_job(channel: Channel, trigger: &MessageTrigger, delay_ms: u64) -> anyhow::Result<Job> {
    Ok(Job::from_payload(channel.as_str(), trigger)?
        .with_delay(delay_ms)
        .with_job_id(send_job_id(trigger.campaign_id, trigger.user_id)))
}

pub fn generate_list_job(campaign_id: i64, delay_ms: u64) -> anyhow::Result<Job> {
    Ok(Job::from_payload(CAMPAIGN_GENERATE_LIST_JOB, &CampaignJob { campaign_id })?
        .with_delay(delay_ms)
        .with_job_id(format!("campaign_generate_{campaign_id}")))
}

pub fn campaign_send_job(campaign_id: i64) -> anyhow::Result<Job> {
    Ok(Job::from_payload(CAMPAIGN_SEND_JOB, &CampaignJob { campaign_id })?
        .with_job_id(format!("campaign_send_{campaign_id}")))
}

pub fn event_post_job(trigger: &EventPostTrigger) -> anyhow::Result<Job> {
    Ok(Job::from_payload(EVENT_POST_JOB, trigger)?)
}

/// Registry with a handler for every engine job.
pub fn job_registry(ctx: &EngineContext) -> JobRegistry {
    let ctx = Arc::new(ctx.clone());
    let mut registry = JobRegistry::new();
    registry
        .register(CAMPAIGN_GENERATE_LIST_JOB, Arc::new(GenerateListHandler { ctx: ctx.clone() }))
        .register(CAMPAIGN_SEND_JOB, Arc::new(CampaignSendHandler { ctx: ctx.clone() }))
        .register(EVENT_POST_JOB, Arc::new(EventPostHandler { ctx: ctx.clone() }))
        .register(JOURNEY_DELAY_JOB, Arc::new(JourneyDelayHandler { ctx: ctx.clone() }));
    for channel in Channel::ALL {
        registry.register(
            channel.as_str(),
            Arc::new(ChannelSendHandler {
                ctx: ctx.clone(),
                channel,
            }),
        );
    }
    info!(jobs = ?registry.names(), "Job handlers registered");
    registry
}

struct GenerateListHandler {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl JobHandler for GenerateListHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let CampaignJob { campaign_id } = job.payload()?;
        let Some(campaign) = self.ctx.campaigns.find_campaign(campaign_id).await? else {
            debug!(campaign_id, "Campaign gone, skipping list generation");
            return Ok(());
        };
        if campaign.state.is_inactive() {
            debug!(campaign_id, state = ?campaign.state, "Campaign inactive, skipping list generation");
            return Ok(());
        }
        generator::generate_send_list(&self.ctx, &campaign).await?;
        Ok(())
    }
}

struct CampaignSendHandler {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl JobHandler for CampaignSendHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let CampaignJob { campaign_id } = job.payload()?;
        dispatcher::send_campaign(&self.ctx, campaign_id).await?;
        Ok(())
    }
}

struct ChannelSendHandler {
    ctx: Arc<EngineContext>,
    channel: Channel,
}

#[async_trait]
impl JobHandler for ChannelSendHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let trigger: MessageTrigger = job.payload()?;
        let outcome = dispatcher::deliver(&self.ctx, &trigger).await?;
        debug!(
            channel = %self.channel,
            campaign_id = trigger.campaign_id,
            user_id = trigger.user_id,
            ?outcome,
            "Send job finished"
        );
        Ok(())
    }
}

struct EventPostHandler {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl JobHandler for EventPostHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let trigger: EventPostTrigger = job.payload()?;
        events::process_event(&self.ctx, &trigger).await?;
        Ok(())
    }
}

struct JourneyDelayHandler {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl JobHandler for JourneyDelayHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JourneyDelayTrigger { journey_id, user_id } = job.payload()?;
        let Some(user) = self.ctx.users.get_user(user_id).await? else {
            debug!(journey_id, user_id, "User gone, dropping journey delay");
            return Ok(());
        };
        self.ctx.journeys.advance(journey_id, &user).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::MemoryBackend;
    use campaign_core::config::AppConfig;

    #[test]
    fn test_send_job_shape() {
        let trigger = MessageTrigger {
            campaign_id: 4,
            user_id: 9,
            event_id: None,
        };
        let job = send_job(Channel::Push, &trigger, 250).unwrap();
        assert_eq!(job.name, "push");
        assert_eq!(job.options.job_id.as_deref(), Some("send_4_9"));
        assert_eq!(job.options.delay_ms, 250);
        assert_eq!(job.options.attempts, 3);
        assert_eq!(job.payload::<MessageTrigger>().unwrap(), trigger);
    }

    #[test]
    fn test_campaign_job_ids() {
        assert_eq!(
            generate_list_job(3, 0).unwrap().options.job_id.as_deref(),
            Some("campaign_generate_3")
        );
        assert_eq!(
            campaign_send_job(3).unwrap().options.job_id.as_deref(),
            Some("campaign_send_3")
        );
    }

    #[tokio::test]
    async fn test_registry_covers_every_job() {
        let backend = MemoryBackend::new(AppConfig::default());
        let registry = job_registry(&backend.context());
        for name in [
            CAMPAIGN_GENERATE_LIST_JOB,
            CAMPAIGN_SEND_JOB,
            EVENT_POST_JOB,
            JOURNEY_DELAY_JOB,
            "email",
            "text",
            "push",
            "webhook",
        ] {
            assert!(registry.contains(name), "missing handler for {name}");
        }
    }

    #[tokio::test]
    async fn test_bad_payload_is_terminal() {
        let backend = MemoryBackend::new(AppConfig::default());
        let registry = job_registry(&backend.context());
        let job = Job::new(CAMPAIGN_SEND_JOB, serde_json::json!({"nope": true}));
        assert!(matches!(registry.dispatch(&job).await, Err(JobError::Terminal(_))));
    }
}
