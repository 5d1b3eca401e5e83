//! Channel providers, materialised from stored provider records through a
//! registry keyed by provider type.

use async_trait::async_trait;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{Channel, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A configured provider as stored for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: i64,
    pub project_id: i64,
    pub channel: Channel,
    /// Registry key, e.g. `logger`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    /// Sends allowed per throttle window. `None` or 0 is unlimited.
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl ProviderRecord {
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit.unwrap_or(0)
    }
}

/// Message content for one channel. Rendering happens elsewhere; the
/// payload is handed to the provider as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub project_id: i64,
    pub channel: Channel,
    #[serde(default)]
    pub data: Value,
}

/// One message addressed to one user.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub campaign_id: i64,
    pub user: &'a User,
    pub template: &'a Template,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_id: i64,
    pub message_id: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> i64;

    fn channel(&self) -> Channel;

    async fn send(&self, message: &Message<'_>) -> CampaignResult<SendReceipt>;
}

/// Builds a provider from its stored record.
pub type ProviderFactory = fn(&ProviderRecord) -> CampaignResult<Arc<dyn Provider>>;

/// Provider types chosen at startup, keyed by `ProviderRecord::kind`.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `logger` type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(LoggerProvider::KIND, LoggerProvider::factory);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: ProviderFactory) -> &mut Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, record: &ProviderRecord) -> CampaignResult<Arc<dyn Provider>> {
        let factory = self.factories.get(&record.kind).ok_or_else(|| {
            CampaignError::Provider(format!("unknown provider type `{}`", record.kind))
        })?;
        factory(record)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// `data` of a logger provider record.
#[derive(Debug, Default, Deserialize)]
struct LoggerSettings {
    /// Fail every send.
    #[serde(default)]
    fail: bool,
}

/// Logs each send instead of calling a vendor. Exists for every channel.
/// `data.fail = true` makes every send fail.
pub struct LoggerProvider {
    id: i64,
    channel: Channel,
    fail: bool,
}

impl LoggerProvider {
    pub const KIND: &'static str = "logger";

    /// Fails when the record's `data` is not a valid settings object.
    pub fn new(record: &ProviderRecord) -> CampaignResult<Self> {
        let settings = match &record.data {
            Value::Null => LoggerSettings::default(),
            data => serde_json::from_value::<LoggerSettings>(data.clone())?,
        };
        let fail = settings.fail;
        info!(
            provider_id = record.id,
            channel = %record.channel,
            fail,
            "Logger provider initialized"
        );
        Ok(Self {
            id: record.id,
            channel: record.channel,
            fail,
        })
    }

    fn factory(record: &ProviderRecord) -> CampaignResult<Arc<dyn Provider>> {
        Ok(Arc::new(Self::new(record)?))
    }

    /// Address for the channel, where the channel needs one.
    fn destination(&self, user: &User) -> CampaignResult<Option<String>> {
        match self.channel {
            Channel::Email => user
                .email
                .clone()
                .map(Some)
                .ok_or_else(|| CampaignError::Provider(format!("user {} has no email", user.id))),
            Channel::Text => user
                .phone
                .clone()
                .map(Some)
                .ok_or_else(|| CampaignError::Provider(format!("user {} has no phone", user.id))),
            Channel::Push | Channel::Webhook => Ok(None),
        }
    }
}

#[async_trait]
impl Provider for LoggerProvider {
    fn id(&self) -> i64 {
        self.id
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &Message<'_>) -> CampaignResult<SendReceipt> {
        if self.fail {
            warn!(provider_id = self.id, user_id = message.user.id, "Simulated provider failure");
            return Err(CampaignError::Provider(format!(
                "provider {} configured to fail",
                self.id
            )));
        }
        let to = self.destination(message.user)?;

        debug!(
            provider_id = self.id,
            channel = %self.channel,
            campaign_id = message.campaign_id,
            user_id = message.user.id,
            to = ?to,
            template_id = message.template.id,
            "Logger provider send"
        );
        metrics::counter!("provider.sent", "channel" => self.channel.as_str()).increment(1);

        Ok(SendReceipt {
            provider_id: self.id,
            message_id: Uuid::new_v4().to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(channel: Channel, data: Value) -> ProviderRecord {
        ProviderRecord {
            id: 3,
            project_id: 1,
            channel,
            kind: "logger".into(),
            data,
            rate_limit: None,
        }
    }

    fn template(channel: Channel) -> Template {
        Template {
            id: 11,
            project_id: 1,
            channel,
            data: json!({"subject": "Hi"}),
        }
    }

    #[test]
    fn test_record_wire_shape() {
        let record: ProviderRecord = serde_json::from_value(json!({
            "id": 1,
            "project_id": 1,
            "channel": "text",
            "type": "logger",
            "rate_limit": 5
        }))
        .unwrap();
        assert_eq!(record.kind, "logger");
        assert_eq!(record.channel, Channel::Text);
        assert_eq!(record.rate_limit(), 5);
    }

    #[tokio::test]
    async fn test_logger_sends_and_fails_on_flag() {
        let registry = ProviderRegistry::with_defaults();
        let user = User::new(7, 1, "ext-7").with_email("a@b.co");
        let template = template(Channel::Email);
        let message = Message {
            campaign_id: 2,
            user: &user,
            template: &template,
        };

        let ok = registry.build(&record(Channel::Email, json!({}))).unwrap();
        let receipt = ok.send(&message).await.unwrap();
        assert_eq!(receipt.provider_id, 3);

        let failing = registry
            .build(&record(Channel::Email, json!({"fail": true})))
            .unwrap();
        assert!(matches!(failing.send(&message).await, Err(CampaignError::Provider(_))));
    }

    #[tokio::test]
    async fn test_text_requires_phone() {
        let provider = LoggerProvider::new(&record(Channel::Text, json!({}))).unwrap();
        let user = User::new(7, 1, "ext-7");
        let template = template(Channel::Text);
        let message = Message {
            campaign_id: 2,
            user: &user,
            template: &template,
        };
        assert!(provider.send(&message).await.is_err());
    }

    #[test]
    fn test_malformed_settings_rejected() {
        let registry = ProviderRegistry::with_defaults();
        let result = registry.build(&record(Channel::Email, json!({"fail": "sometimes"})));
        assert!(matches!(result, Err(CampaignError::Serialization(_))));
        assert!(registry.build(&record(Channel::Email, Value::Null)).is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let registry = ProviderRegistry::with_defaults();
        let mut record = record(Channel::Push, json!({}));
        record.kind = "sendgrid".into();
        assert!(registry.build(&record).is_err());
        assert_eq!(registry.kinds(), vec!["logger".to_string()]);
    }
}
