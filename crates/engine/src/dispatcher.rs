//! Campaign dispatch: stream a campaign's pending sends and deliver each
//! one through its provider, deferring throttled sends by requeueing
//! their job instead of waiting.

use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use campaign_core::error::CampaignError;
use campaign_core::types::{Campaign, CampaignState, NewEvent, SendState};
use campaign_delivery::Message;

use crate::context::EngineContext;
use crate::events::create_event;
use crate::jobs::{send_job, MessageTrigger};
use crate::store::send_ready_stream;

/// What one delivery attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed,
    /// Requeued to run again after `ms_remaining`.
    Throttled { ms_remaining: u64 },
    /// Nothing to do: campaign, user or template gone, campaign inactive,
    /// or already sent.
    Skipped,
}

/// Tally of one `campaign_send` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub throttled: usize,
    pub skipped: usize,
    pub finished: bool,
}

impl DispatchSummary {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::Throttled { .. } => self.throttled += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Deliver every pending send of the campaign, then close the campaign
/// once nothing is left pending or throttled.
pub async fn send_campaign(ctx: &EngineContext, campaign_id: i64) -> anyhow::Result<DispatchSummary> {
    let mut summary = DispatchSummary::default();
    let Some(campaign) = ctx.campaigns.find_campaign(campaign_id).await? else {
        debug!(campaign_id, "Campaign gone, skipping send");
        return Ok(summary);
    };
    if campaign.state.is_inactive() {
        debug!(campaign_id, state = ?campaign.state, "Campaign inactive, skipping send");
        return Ok(summary);
    }

    let mut rows = send_ready_stream(ctx.sends.clone(), campaign.id, ctx.config.dispatch.stream_batch_size);
    while let Some(row) = rows.next().await {
        let row = row?;
        let trigger = MessageTrigger {
            campaign_id: campaign.id,
            user_id: row.user_id,
            event_id: None,
        };
        let outcome = deliver(ctx, &trigger).await?;
        summary.record(outcome);
    }

    summary.finished = finish_if_drained(ctx, &campaign).await?;

    info!(
        campaign_id,
        sent = summary.sent,
        failed = summary.failed,
        throttled = summary.throttled,
        skipped = summary.skipped,
        finished = summary.finished,
        "Campaign send pass complete"
    );
    Ok(summary)
}

/// Deliver one campaign message to one user.
///
/// Provider failures become a `failed` row plus an error-tracker
/// notification and never propagate. Only store and queue errors do.
pub async fn deliver(ctx: &EngineContext, trigger: &MessageTrigger) -> anyhow::Result<DeliveryOutcome> {
    let MessageTrigger {
        campaign_id,
        user_id,
        ..
    } = *trigger;

    let Some(campaign) = ctx.campaigns.find_campaign(campaign_id).await? else {
        debug!(campaign_id, user_id, "Campaign gone, skipping delivery");
        return Ok(DeliveryOutcome::Skipped);
    };
    if campaign.state.is_inactive() {
        debug!(campaign_id, user_id, state = ?campaign.state, "Campaign inactive, skipping delivery");
        return Ok(DeliveryOutcome::Skipped);
    }
    let Some(user) = ctx.users.get_user(user_id).await? else {
        debug!(campaign_id, user_id, "User gone, skipping delivery");
        return Ok(DeliveryOutcome::Skipped);
    };
    let previous = ctx.sends.get_send(campaign_id, user_id).await?.map(|s| s.state);
    if previous == Some(SendState::Sent) {
        debug!(campaign_id, user_id, "Already sent");
        return Ok(DeliveryOutcome::Skipped);
    }
    let template = match campaign.template_id {
        Some(id) => ctx.campaigns.template(id).await?,
        None => None,
    };
    let Some(template) = template else {
        debug!(campaign_id, user_id, "Template missing, skipping delivery");
        return Ok(DeliveryOutcome::Skipped);
    };

    let Some(record) = ctx.campaigns.provider(campaign.provider_id).await? else {
        let err = CampaignError::NotFound {
            entity: "provider",
            id: campaign.provider_id,
        };
        return fail(ctx, &campaign, trigger, previous, err.into()).await;
    };
    let provider = match ctx.providers.build(&record) {
        Ok(provider) => provider,
        Err(e) => return fail(ctx, &campaign, trigger, previous, e.into()).await,
    };

    let rate_limit = match record.rate_limit() {
        0 => ctx.config.dispatch.default_rate_limit,
        limit => limit,
    };
    if let Some(throttle) = ctx.throttle.throttle_send(record.id, rate_limit).await? {
        if throttle.exceeded {
            ctx.sends
                .update_send_state(campaign_id, user_id, SendState::Throttled)
                .await?;
            ctx.queue
                .enqueue(send_job(campaign.channel, trigger, throttle.ms_remaining)?)
                .await?;
            metrics::counter!("dispatch.throttled", "channel" => campaign.channel.as_str()).increment(1);
            debug!(
                campaign_id,
                user_id,
                provider_id = record.id,
                ms_remaining = throttle.ms_remaining,
                "Send throttled, requeued"
            );
            return Ok(DeliveryOutcome::Throttled {
                ms_remaining: throttle.ms_remaining,
            });
        }
    }

    let message = Message {
        campaign_id,
        user: &user,
        template: &template,
    };
    let receipt = match provider.send(&message).await {
        Ok(receipt) => receipt,
        Err(e) => return fail(ctx, &campaign, trigger, previous, e.into()).await,
    };

    ctx.sends
        .update_send_state(campaign_id, user_id, SendState::Sent)
        .await?;
    metrics::counter!("dispatch.sent", "channel" => campaign.channel.as_str()).increment(1);

    let event = NewEvent::new(
        campaign.channel.sent_event(),
        json!({
            "campaign_id": campaign_id,
            "provider_id": receipt.provider_id,
            "message_id": receipt.message_id,
        }),
    );
    create_event(ctx, &user, event).await?;

    // The campaign pass left this row open; closing it may finish the campaign.
    if previous == Some(SendState::Throttled) {
        finish_if_drained(ctx, &campaign).await?;
    }
    Ok(DeliveryOutcome::Sent)
}

/// Move a running campaign to `finished` once no row is pending or
/// throttled. Returns whether it did.
async fn finish_if_drained(ctx: &EngineContext, campaign: &Campaign) -> anyhow::Result<bool> {
    if campaign.state != CampaignState::Running || ctx.sends.open_sends(campaign.id).await? > 0 {
        return Ok(false);
    }
    ctx.campaigns
        .update_campaign_state(campaign.id, CampaignState::Finished)
        .await?;
    info!(campaign_id = campaign.id, "Campaign finished");
    Ok(true)
}

async fn fail(
    ctx: &EngineContext,
    campaign: &Campaign,
    trigger: &MessageTrigger,
    previous: Option<SendState>,
    err: anyhow::Error,
) -> anyhow::Result<DeliveryOutcome> {
    ctx.sends
        .update_send_state(trigger.campaign_id, trigger.user_id, SendState::Failed)
        .await?;
    ctx.errors.notify(&err, "dispatcher:deliver");
    metrics::counter!("dispatch.failed").increment(1);
    warn!(
        campaign_id = trigger.campaign_id,
        user_id = trigger.user_id,
        error = %err,
        "Send failed"
    );
    if previous == Some(SendState::Throttled) {
        finish_if_drained(ctx, campaign).await?;
    }
    Ok(DeliveryOutcome::Failed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::MemoryBackend;
    use crate::jobs::EVENT_POST_JOB;
    use campaign_core::config::AppConfig;
    use campaign_core::event_bus::capture_tracker;
    use campaign_core::types::{AudienceSource, Channel, User};
    use campaign_delivery::{ProviderRecord, Template};
    use serde_json::Value;

    fn seed(backend: &MemoryBackend, provider_data: Value, users: &[i64]) {
        backend.store.insert_campaign(Campaign {
            id: 1,
            project_id: 1,
            name: "welcome".into(),
            state: CampaignState::Running,
            channel: Channel::Email,
            provider_id: 2,
            template_id: Some(3),
            audience: AudienceSource::StaticList { list_id: 1 },
            send_at: None,
        });
        backend.store.insert_provider(ProviderRecord {
            id: 2,
            project_id: 1,
            channel: Channel::Email,
            kind: "logger".into(),
            data: provider_data,
            rate_limit: None,
        });
        backend.store.insert_template(Template {
            id: 3,
            project_id: 1,
            channel: Channel::Email,
            data: json!({"subject": "Welcome"}),
        });
        for &id in users {
            backend
                .store
                .insert_user(User::new(id, 1, format!("ext-{id}")).with_email(format!("u{id}@x.co")));
        }
    }

    #[tokio::test]
    async fn test_send_campaign_delivers_and_finishes() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        seed(&backend, json!({}), &[1, 2, 3]);
        ctx.sends.insert_pending(1, &[1, 2, 3]).await.unwrap();

        let summary = send_campaign(&ctx, 1).await.unwrap();
        assert_eq!(summary.sent, 3);
        assert!(summary.finished);
        assert_eq!(backend.store.campaign_state(1), Some(CampaignState::Finished));

        // Every send emitted `email_sent` and queued its event_post.
        assert_eq!(backend.store.events_for(2)[0].name, "email_sent");
        let posts = backend
            .queue
            .pending_jobs()
            .into_iter()
            .filter(|j| j.name == EVENT_POST_JOB)
            .count();
        assert_eq!(posts, 3);
    }

    #[tokio::test]
    async fn test_provider_failure_marks_failed_and_continues() {
        let tracker = capture_tracker();
        let backend = MemoryBackend::new(AppConfig::default()).with_errors(tracker.clone());
        let ctx = backend.context();
        seed(&backend, json!({}), &[1, 3]);
        // User 2 has no email, so the email provider rejects it.
        backend.store.insert_user(User::new(2, 1, "ext-2"));
        ctx.sends.insert_pending(1, &[1, 2, 3]).await.unwrap();

        let summary = send_campaign(&ctx, 1).await.unwrap();
        assert_eq!((summary.sent, summary.failed), (2, 1));
        assert_eq!(backend.store.send_state(1, 2), Some(SendState::Failed));
        assert_eq!(backend.store.send_state(1, 3), Some(SendState::Sent));
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.errors()[0].0, "dispatcher:deliver");
    }

    #[tokio::test]
    async fn test_missing_provider_fails_send() {
        let tracker = capture_tracker();
        let backend = MemoryBackend::new(AppConfig::default()).with_errors(tracker.clone());
        let ctx = backend.context();
        seed(&backend, json!({}), &[1]);
        backend.store.insert_campaign(Campaign {
            provider_id: 99,
            ..ctx.campaigns.find_campaign(1).await.unwrap().unwrap()
        });

        let trigger = MessageTrigger {
            campaign_id: 1,
            user_id: 1,
            event_id: None,
        };
        assert_eq!(deliver(&ctx, &trigger).await.unwrap(), DeliveryOutcome::Failed);
        assert_eq!(
            tracker.errors(),
            vec![("dispatcher:deliver".to_string(), "provider 99 not found".to_string())]
        );
    }

    #[tokio::test]
    async fn test_inactive_and_sent_are_skipped() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        seed(&backend, json!({}), &[1]);
        let trigger = MessageTrigger {
            campaign_id: 1,
            user_id: 1,
            event_id: None,
        };

        assert_eq!(deliver(&ctx, &trigger).await.unwrap(), DeliveryOutcome::Sent);
        assert_eq!(deliver(&ctx, &trigger).await.unwrap(), DeliveryOutcome::Skipped);

        ctx.campaigns
            .update_campaign_state(1, CampaignState::Aborted)
            .await
            .unwrap();
        let summary = send_campaign(&ctx, 1).await.unwrap();
        assert_eq!(summary, DispatchSummary::default());
    }
}
