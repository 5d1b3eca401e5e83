//! Persistence contracts the engine reads and writes through, and an
//! in-memory store implementing all of them.
//!
//! Production deployments back these traits with their own database; the
//! memory store serves the `memory` backend and tests.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use campaign_core::types::{
    Campaign, CampaignSend, CampaignState, NewEvent, ReadySend, SendState, User, UserEvent,
};
use campaign_delivery::{ProviderRecord, Template};

/// A named audience. Dynamic lists follow a rule root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserList {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub kind: ListKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ListKind {
    Static,
    Dynamic { rule_uuid: Uuid },
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn find_campaign(&self, id: i64) -> anyhow::Result<Option<Campaign>>;

    /// Project-scoped lookup; a campaign of another project is `None`.
    async fn get_campaign(&self, id: i64, project_id: i64) -> anyhow::Result<Option<Campaign>> {
        Ok(self
            .find_campaign(id)
            .await?
            .filter(|c| c.project_id == project_id))
    }

    async fn update_campaign_state(&self, id: i64, state: CampaignState) -> anyhow::Result<()>;

    async fn template(&self, id: i64) -> anyhow::Result<Option<Template>>;

    async fn provider(&self, id: i64) -> anyhow::Result<Option<ProviderRecord>>;
}

#[async_trait]
pub trait SendStore: Send + Sync {
    /// Insert `pending` rows for users without a row yet. Returns how many
    /// were inserted.
    async fn insert_pending(&self, campaign_id: i64, user_ids: &[i64]) -> anyhow::Result<usize>;

    /// Up to `limit` pending rows with `send_id > after`, by `send_id`.
    async fn ready_page(&self, campaign_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<ReadySend>>;

    async fn get_send(&self, campaign_id: i64, user_id: i64) -> anyhow::Result<Option<CampaignSend>>;

    /// Set the state of the `(campaign, user)` row, creating it if needed.
    async fn update_send_state(&self, campaign_id: i64, user_id: i64, state: SendState) -> anyhow::Result<()>;

    /// Rows still `pending` or `throttled`.
    async fn open_sends(&self, campaign_id: i64) -> anyhow::Result<usize>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>>;

    /// Up to `limit` users of the project with `id > after`, by id.
    async fn users_page(&self, project_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<User>>;

    async fn count_users(&self, project_id: i64) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ListStore: Send + Sync {
    async fn get_list(&self, id: i64) -> anyhow::Result<Option<UserList>>;

    async fn dynamic_lists(&self, project_id: i64) -> anyhow::Result<Vec<UserList>>;

    /// Up to `limit` member user ids with `user_id > after`, ascending.
    async fn members_page(&self, list_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<i64>>;

    async fn count_members(&self, list_id: i64) -> anyhow::Result<u64>;

    /// Returns whether the user was newly added.
    async fn add_user(&self, list_id: i64, user_id: i64) -> anyhow::Result<bool>;

    /// Returns whether the user was a member.
    async fn remove_user(&self, list_id: i64, user_id: i64) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store `event` under the idempotency `key`. Inserting a key that is
    /// already stored returns the existing row.
    async fn insert_event(&self, key: Uuid, user: &User, event: &NewEvent) -> anyhow::Result<UserEvent>;

    async fn get_event(&self, id: i64) -> anyhow::Result<Option<UserEvent>>;
}

/// Stream the rows of a cursor-paged query. A producer task fetches one
/// page at a time into a bounded channel, so at most one page is held
/// ahead of the consumer. Each call starts again from the beginning.
pub fn paged_stream<T, F, Fut>(
    batch: usize,
    cursor_of: fn(&T) -> i64,
    fetch: F,
) -> ReceiverStream<anyhow::Result<T>>
where
    T: Send + 'static,
    F: Fn(i64, usize) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<T>>> + Send + 'static,
{
    let batch = batch.max(1);
    let (tx, rx) = mpsc::channel(batch);
    tokio::spawn(async move {
        let mut after = 0;
        loop {
            let rows = match fetch(after, batch).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let last_page = rows.len() < batch;
            if let Some(last) = rows.last() {
                after = cursor_of(last);
            }
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
            }
            if last_page {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Pending sends of a campaign, lazily.
pub fn send_ready_stream(
    sends: Arc<dyn SendStore>,
    campaign_id: i64,
    batch: usize,
) -> ReceiverStream<anyhow::Result<ReadySend>> {
    paged_stream(batch, |row: &ReadySend| row.send_id, move |after, limit| {
        let sends = sends.clone();
        async move { sends.ready_page(campaign_id, after, limit).await }
    })
}

/// Every user of a project, lazily.
pub fn user_stream(users: Arc<dyn UserStore>, project_id: i64, batch: usize) -> ReceiverStream<anyhow::Result<User>> {
    paged_stream(batch, |user: &User| user.id, move |after, limit| {
        let users = users.clone();
        async move { users.users_page(project_id, after, limit).await }
    })
}

/// Member ids of a list, lazily.
pub fn member_stream(lists: Arc<dyn ListStore>, list_id: i64, batch: usize) -> ReceiverStream<anyhow::Result<i64>> {
    paged_stream(batch, |id: &i64| *id, move |after, limit| {
        let lists = lists.clone();
        async move { lists.members_page(list_id, after, limit).await }
    })
}

/// DashMap-backed store for every engine contract.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: DashMap<i64, Campaign>,
    templates: DashMap<i64, Template>,
    providers: DashMap<i64, ProviderRecord>,
    users: DashMap<i64, User>,
    lists: DashMap<i64, UserList>,
    members: DashMap<i64, BTreeSet<i64>>,
    sends: DashMap<(i64, i64), CampaignSend>,
    events: DashMap<i64, UserEvent>,
    event_keys: DashMap<Uuid, i64>,
    send_seq: AtomicI64,
    event_seq: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Engine store initialized (in-memory)");
        Self::default()
    }

    // ─── Seeding ───────────────────────────────────────────────────────────

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn insert_template(&self, template: Template) {
        self.templates.insert(template.id, template);
    }

    pub fn insert_provider(&self, provider: ProviderRecord) {
        self.providers.insert(provider.id, provider);
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn insert_list(&self, list: UserList, members: impl IntoIterator<Item = i64>) {
        self.members.insert(list.id, members.into_iter().collect());
        self.lists.insert(list.id, list);
    }

    // ─── Inspection ────────────────────────────────────────────────────────

    pub fn campaign_state(&self, id: i64) -> Option<CampaignState> {
        self.campaigns.get(&id).map(|c| c.state)
    }

    pub fn send_state(&self, campaign_id: i64, user_id: i64) -> Option<SendState> {
        self.sends.get(&(campaign_id, user_id)).map(|s| s.state)
    }

    /// All rows of a campaign ordered by `send_id`.
    pub fn sends_for(&self, campaign_id: i64) -> Vec<CampaignSend> {
        let mut rows: Vec<CampaignSend> = self
            .sends
            .iter()
            .filter(|e| e.key().0 == campaign_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|s| s.send_id);
        rows
    }

    pub fn members(&self, list_id: i64) -> Vec<i64> {
        self.members
            .get(&list_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// A user's events, oldest first.
    pub fn events_for(&self, user_id: i64) -> Vec<UserEvent> {
        let mut events: Vec<UserEvent> = self
            .events
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        events.sort_by_key(|e| e.id);
        events
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn find_campaign(&self, id: i64) -> anyhow::Result<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn update_campaign_state(&self, id: i64, state: CampaignState) -> anyhow::Result<()> {
        if let Some(mut campaign) = self.campaigns.get_mut(&id) {
            campaign.state = state;
        }
        Ok(())
    }

    async fn template(&self, id: i64) -> anyhow::Result<Option<Template>> {
        Ok(self.templates.get(&id).map(|t| t.clone()))
    }

    async fn provider(&self, id: i64) -> anyhow::Result<Option<ProviderRecord>> {
        Ok(self.providers.get(&id).map(|p| p.clone()))
    }
}

#[async_trait]
impl SendStore for MemoryStore {
    async fn insert_pending(&self, campaign_id: i64, user_ids: &[i64]) -> anyhow::Result<usize> {
        let mut inserted = 0;
        for &user_id in user_ids {
            self.sends.entry((campaign_id, user_id)).or_insert_with(|| {
                inserted += 1;
                CampaignSend {
                    send_id: self.send_seq.fetch_add(1, Ordering::SeqCst) + 1,
                    campaign_id,
                    user_id,
                    state: SendState::Pending,
                    updated_at: Utc::now(),
                }
            });
        }
        Ok(inserted)
    }

    async fn ready_page(&self, campaign_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<ReadySend>> {
        let mut rows: Vec<ReadySend> = self
            .sends
            .iter()
            .filter(|e| {
                let send = e.value();
                send.campaign_id == campaign_id && send.state == SendState::Pending && send.send_id > after
            })
            .map(|e| ReadySend {
                user_id: e.value().user_id,
                send_id: e.value().send_id,
            })
            .collect();
        rows.sort_by_key(|r| r.send_id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_send(&self, campaign_id: i64, user_id: i64) -> anyhow::Result<Option<CampaignSend>> {
        Ok(self.sends.get(&(campaign_id, user_id)).map(|s| s.clone()))
    }

    async fn update_send_state(&self, campaign_id: i64, user_id: i64, state: SendState) -> anyhow::Result<()> {
        let mut send = self
            .sends
            .entry((campaign_id, user_id))
            .or_insert_with(|| CampaignSend {
                send_id: self.send_seq.fetch_add(1, Ordering::SeqCst) + 1,
                campaign_id,
                user_id,
                state,
                updated_at: Utc::now(),
            });
        send.state = state;
        send.updated_at = Utc::now();
        Ok(())
    }

    async fn open_sends(&self, campaign_id: i64) -> anyhow::Result<usize> {
        Ok(self
            .sends
            .iter()
            .filter(|e| {
                e.key().0 == campaign_id
                    && matches!(e.value().state, SendState::Pending | SendState::Throttled)
            })
            .count())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn users_page(&self, project_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<User>> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .filter(|e| e.value().project_id == project_id && *e.key() > after)
            .map(|e| e.value().clone())
            .collect();
        users.sort_by_key(|u| u.id);
        users.truncate(limit);
        Ok(users)
    }

    async fn count_users(&self, project_id: i64) -> anyhow::Result<u64> {
        Ok(self
            .users
            .iter()
            .filter(|e| e.value().project_id == project_id)
            .count() as u64)
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn get_list(&self, id: i64) -> anyhow::Result<Option<UserList>> {
        Ok(self.lists.get(&id).map(|l| l.clone()))
    }

    async fn dynamic_lists(&self, project_id: i64) -> anyhow::Result<Vec<UserList>> {
        let mut lists: Vec<UserList> = self
            .lists
            .iter()
            .filter(|e| e.value().project_id == project_id && matches!(e.value().kind, ListKind::Dynamic { .. }))
            .map(|e| e.value().clone())
            .collect();
        lists.sort_by_key(|l| l.id);
        Ok(lists)
    }

    async fn members_page(&self, list_id: i64, after: i64, limit: usize) -> anyhow::Result<Vec<i64>> {
        Ok(self
            .members
            .get(&list_id)
            .map(|m| m.range(after.saturating_add(1)..).take(limit).copied().collect())
            .unwrap_or_default())
    }

    async fn count_members(&self, list_id: i64) -> anyhow::Result<u64> {
        Ok(self.members.get(&list_id).map(|m| m.len() as u64).unwrap_or(0))
    }

    async fn add_user(&self, list_id: i64, user_id: i64) -> anyhow::Result<bool> {
        Ok(self.members.entry(list_id).or_default().insert(user_id))
    }

    async fn remove_user(&self, list_id: i64, user_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .members
            .get_mut(&list_id)
            .map(|mut m| m.remove(&user_id))
            .unwrap_or(false))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, key: Uuid, user: &User, event: &NewEvent) -> anyhow::Result<UserEvent> {
        let id = match self.event_keys.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                if let Some(stored) = self.events.get(&id) {
                    return Ok(stored.clone());
                }
                id
            }
            Entry::Vacant(slot) => *slot.insert(self.event_seq.fetch_add(1, Ordering::SeqCst) + 1),
        };
        let stored = UserEvent {
            id,
            project_id: user.project_id,
            user_id: user.id,
            name: event.name.clone(),
            data: event.data.clone(),
            created_at: Utc::now(),
        };
        self.events.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_event(&self, id: i64) -> anyhow::Result<Option<UserEvent>> {
        Ok(self.events.get(&id).map(|e| e.clone()))
    }
}
