//! Campaign list generation: materialise a campaign's audience as
//! `pending` send rows, one generation per campaign at a time.

use chrono::Utc;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use campaign_cache::{generation_timeout_secs, with_lock};
use campaign_core::types::{AudienceSource, Campaign, CampaignState};

use crate::context::EngineContext;
use crate::jobs::{campaign_send_job, generate_list_job};
use crate::store::{member_stream, user_stream};

pub fn generation_lock_key(campaign_id: i64) -> String {
    format!("campaign_generate_{campaign_id}")
}

/// Upper bound of the audience size, used to size the generation lock.
pub async fn estimated_send_size(ctx: &EngineContext, campaign: &Campaign) -> anyhow::Result<u64> {
    match &campaign.audience {
        AudienceSource::StaticList { list_id } => ctx.lists.count_members(*list_id).await,
        AudienceSource::DynamicRule { .. } => ctx.users.count_users(campaign.project_id).await,
    }
}

/// Queue list generation for when the campaign is due.
pub async fn schedule_campaign(ctx: &EngineContext, campaign: &Campaign) -> anyhow::Result<()> {
    let delay_ms = campaign
        .send_at
        .map(|at| (at - Utc::now()).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    ctx.queue.enqueue(generate_list_job(campaign.id, delay_ms)?).await?;
    info!(campaign_id = campaign.id, delay_ms, "Campaign scheduled");
    Ok(())
}

/// Insert `pending` rows for the audience and queue the campaign send.
///
/// Returns `None` when another generation for this campaign holds the
/// lock, otherwise the number of rows inserted.
pub async fn generate_send_list(ctx: &EngineContext, campaign: &Campaign) -> anyhow::Result<Option<usize>> {
    let estimated = estimated_send_size(ctx, campaign).await?;
    let timeout = generation_timeout_secs(
        estimated,
        ctx.config.lock.users_per_second,
        ctx.config.lock.min_timeout_secs,
    );
    let key = generation_lock_key(campaign.id);

    let generated = with_lock(ctx.lock.as_ref(), &key, timeout, || async {
        if campaign.state == CampaignState::Scheduled {
            ctx.campaigns
                .update_campaign_state(campaign.id, CampaignState::Running)
                .await?;
        }

        let inserted = match &campaign.audience {
            AudienceSource::StaticList { list_id } => copy_list(ctx, campaign.id, *list_id).await?,
            AudienceSource::DynamicRule { rule_uuid } => {
                collect_matching(ctx, campaign, *rule_uuid).await?
            }
        };

        ctx.queue.enqueue(campaign_send_job(campaign.id)?).await?;
        Ok(inserted)
    })
    .await?;

    match generated {
        Some(inserted) => {
            metrics::counter!("generator.rows_inserted").increment(inserted as u64);
            info!(
                campaign_id = campaign.id,
                estimated,
                inserted,
                lock_timeout_secs = timeout,
                "Send list generated"
            );
        }
        None => debug!(campaign_id = campaign.id, "Generation already in flight"),
    }
    Ok(generated)
}

async fn copy_list(ctx: &EngineContext, campaign_id: i64, list_id: i64) -> anyhow::Result<usize> {
    let batch = ctx.config.dispatch.stream_batch_size.max(1);
    let mut members = member_stream(ctx.lists.clone(), list_id, batch);
    let mut pending = Vec::with_capacity(batch);
    let mut inserted = 0;

    while let Some(user_id) = members.next().await {
        pending.push(user_id?);
        if pending.len() >= batch {
            inserted += ctx.sends.insert_pending(campaign_id, &pending).await?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        inserted += ctx.sends.insert_pending(campaign_id, &pending).await?;
    }
    Ok(inserted)
}

async fn collect_matching(ctx: &EngineContext, campaign: &Campaign, rule_uuid: uuid::Uuid) -> anyhow::Result<usize> {
    let batch = ctx.config.dispatch.stream_batch_size.max(1);
    let mut users = user_stream(ctx.users.clone(), campaign.project_id, batch);
    let mut pending = Vec::with_capacity(batch);
    let mut inserted = 0;

    while let Some(user) = users.next().await {
        let user = user?;
        let results = ctx.rules.matching_rules_for_user(&user).await?;
        if !results.is_success(&rule_uuid) {
            continue;
        }
        pending.push(user.id);
        if pending.len() >= batch {
            inserted += ctx.sends.insert_pending(campaign.id, &pending).await?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        inserted += ctx.sends.insert_pending(campaign.id, &pending).await?;
    }
    Ok(inserted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::MemoryBackend;
    use crate::jobs::CAMPAIGN_SEND_JOB;
    use crate::store::{ListKind, UserList};
    use campaign_cache::DistributedLock;
    use campaign_core::config::AppConfig;
    use campaign_core::types::{Channel, SendState, User};
    use campaign_rules::{Combinator, NestedRule, Rule, RuleGroup, RuleKind};
    use serde_json::json;

    fn campaign(id: i64, audience: AudienceSource) -> Campaign {
        Campaign {
            id,
            project_id: 1,
            name: format!("campaign-{id}"),
            state: CampaignState::Scheduled,
            channel: Channel::Email,
            provider_id: 1,
            template_id: Some(1),
            audience,
            send_at: None,
        }
    }

    #[tokio::test]
    async fn test_static_list_copies_members_once() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        backend.store.insert_list(
            UserList {
                id: 5,
                project_id: 1,
                name: "beta".into(),
                kind: ListKind::Static,
            },
            [1, 2, 3],
        );
        let c = campaign(10, AudienceSource::StaticList { list_id: 5 });
        backend.store.insert_campaign(c.clone());

        assert_eq!(generate_send_list(&ctx, &c).await.unwrap(), Some(3));
        assert_eq!(backend.store.campaign_state(10), Some(CampaignState::Running));
        assert!(backend
            .store
            .sends_for(10)
            .iter()
            .all(|s| s.state == SendState::Pending));

        let jobs = backend.queue.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, CAMPAIGN_SEND_JOB);
        assert_eq!(jobs[0].options.job_id.as_deref(), Some("campaign_send_10"));

        // Re-running adds nothing for users already recorded.
        assert_eq!(generate_send_list(&ctx, &c).await.unwrap(), Some(0));
        assert_eq!(backend.store.sends_for(10).len(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_rule_selects_matching_users() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        let tree = NestedRule::new(
            Rule::parent(Combinator::And),
            vec![NestedRule::leaf(Rule::new(
                RuleGroup::User,
                "$.plan",
                RuleKind::String {
                    operator: "=".into(),
                    value: Some("pro".into()),
                },
            ))],
        );
        ctx.rules.merge_insert_rules(1, &tree).await.unwrap();

        backend.store.insert_user(User::new(1, 1, "a").with_data(json!({"plan": "pro"})));
        backend.store.insert_user(User::new(2, 1, "b").with_data(json!({"plan": "free"})));
        backend.store.insert_user(User::new(3, 1, "c").with_data(json!({"plan": "pro"})));
        backend.store.insert_user(User::new(4, 2, "d").with_data(json!({"plan": "pro"})));

        let c = campaign(11, AudienceSource::DynamicRule { rule_uuid: tree.rule.uuid });
        backend.store.insert_campaign(c.clone());

        assert_eq!(generate_send_list(&ctx, &c).await.unwrap(), Some(2));
        let users: Vec<i64> = backend.store.sends_for(11).iter().map(|s| s.user_id).collect();
        assert_eq!(users, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_skips_when_generation_in_flight() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        let c = campaign(12, AudienceSource::StaticList { list_id: 1 });
        backend.lock.acquire(&generation_lock_key(12), 900).await.unwrap();

        assert_eq!(generate_send_list(&ctx, &c).await.unwrap(), None);
        assert!(backend.queue.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_delays_until_send_at() {
        let backend = MemoryBackend::new(AppConfig::default());
        let ctx = backend.context();
        let mut c = campaign(13, AudienceSource::StaticList { list_id: 1 });
        c.send_at = Some(Utc::now() + chrono::Duration::minutes(5));

        schedule_campaign(&ctx, &c).await.unwrap();
        let jobs = backend.queue.pending_jobs();
        assert_eq!(jobs[0].options.job_id.as_deref(), Some("campaign_generate_13"));
        assert!(jobs[0].options.delay_ms > 4 * 60 * 1000);
    }
}
