use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A project-scoped end user that campaigns and journeys target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub project_id: i64,
    pub external_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Free-form profile attributes.
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: i64, project_id: i64, external_id: impl Into<String>) -> Self {
        Self {
            id,
            project_id,
            external_id: external_id.into(),
            email: None,
            phone: None,
            data: Value::Object(Map::new()),
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Flattened fact view: record fields with `data` keys merged on top.
    /// `data` itself stays reachable under `$.data`.
    pub fn flatten(&self) -> Value {
        let mut facts = Map::new();
        facts.insert("id".into(), Value::from(self.id));
        facts.insert("external_id".into(), Value::from(self.external_id.clone()));
        if let Some(email) = &self.email {
            facts.insert("email".into(), Value::from(email.clone()));
        }
        if let Some(phone) = &self.phone {
            facts.insert("phone".into(), Value::from(phone.clone()));
        }
        facts.insert("created_at".into(), Value::from(self.created_at.to_rfc3339()));
        if let Some(data) = self.data.as_object() {
            for (key, value) in data {
                facts.insert(key.clone(), value.clone());
            }
        }
        facts.insert("data".into(), self.data.clone());
        Value::Object(facts)
    }
}

/// A persisted event that happened to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl UserEvent {
    /// Flattened fact view: `{name, ...data, data}`.
    pub fn flatten(&self) -> Value {
        let mut facts = Map::new();
        if let Some(data) = self.data.as_object() {
            for (key, value) in data {
                facts.insert(key.clone(), value.clone());
            }
        }
        facts.insert("name".into(), Value::from(self.name.clone()));
        facts.insert("data".into(), self.data.clone());
        Value::Object(facts)
    }
}

/// Payload for creating a new user event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl NewEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// The fact set a rule tree is evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facts {
    pub user: Value,
    pub events: Vec<Value>,
}

impl Facts {
    pub fn for_user(user: &User) -> Self {
        Self {
            user: user.flatten(),
            events: Vec::new(),
        }
    }

    pub fn with_event(user: &User, event: &UserEvent) -> Self {
        Self {
            user: user.flatten(),
            events: vec![event.flatten()],
        }
    }
}

/// Delivery channel a campaign sends through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Text,
    Push,
    Webhook,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Text, Channel::Push, Channel::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Text => "text",
            Channel::Push => "push",
            Channel::Webhook => "webhook",
        }
    }

    /// Name of the domain event emitted after a successful send.
    pub fn sent_event(&self) -> String {
        format!("{}_sent", self.as_str())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Scheduled,
    Running,
    Aborted,
    Finished,
}

impl CampaignState {
    /// Job handlers no-op for campaigns in these states.
    pub fn is_inactive(&self) -> bool {
        matches!(self, CampaignState::Aborted | CampaignState::Draft)
    }
}

/// Where a campaign's audience comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AudienceSource {
    StaticList { list_id: i64 },
    DynamicRule { rule_uuid: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub state: CampaignState,
    pub channel: Channel,
    pub provider_id: i64,
    pub template_id: Option<i64>,
    pub audience: AudienceSource,
    pub send_at: Option<DateTime<Utc>>,
}

/// Delivery state of a single per-user send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Pending,
    Sent,
    Failed,
    Throttled,
}

/// Per (campaign, user) delivery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSend {
    pub send_id: i64,
    pub campaign_id: i64,
    pub user_id: i64,
    pub state: SendState,
    pub updated_at: DateTime<Utc>,
}

/// Row yielded by the ready-send stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadySend {
    pub user_id: i64,
    pub send_id: i64,
}
