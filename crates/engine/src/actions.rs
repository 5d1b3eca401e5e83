//! Journey action steps: schedule a campaign send for the user.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use campaign_core::types::{SendState, User};
use campaign_journey::ActionTrigger;
use campaign_queue::JobQueue;

use crate::jobs::{send_job, MessageTrigger};
use crate::store::{CampaignStore, SendStore};

pub struct CampaignActions {
    campaigns: Arc<dyn CampaignStore>,
    sends: Arc<dyn SendStore>,
    queue: Arc<dyn JobQueue>,
}

impl CampaignActions {
    pub fn new(campaigns: Arc<dyn CampaignStore>, sends: Arc<dyn SendStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { campaigns, sends, queue }
    }
}

#[async_trait]
impl ActionTrigger for CampaignActions {
    async fn trigger(&self, user: &User, campaign_id: i64) -> anyhow::Result<()> {
        let Some(campaign) = self.campaigns.get_campaign(campaign_id, user.project_id).await? else {
            debug!(campaign_id, user_id = user.id, "Action campaign missing, skipping");
            return Ok(());
        };
        if campaign.state.is_inactive() {
            debug!(campaign_id, state = ?campaign.state, "Action campaign inactive, skipping");
            return Ok(());
        }
        if let Some(send) = self.sends.get_send(campaign.id, user.id).await? {
            if send.state == SendState::Sent {
                debug!(campaign_id, user_id = user.id, "Already sent, skipping");
                return Ok(());
            }
        }

        self.sends.insert_pending(campaign.id, &[user.id]).await?;
        let trigger = MessageTrigger {
            campaign_id: campaign.id,
            user_id: user.id,
            event_id: None,
        };
        self.queue.enqueue(send_job(campaign.channel, &trigger, 0)?).await
    }
}
