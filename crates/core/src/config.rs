use serde::Deserialize;

/// Root worker configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_WORKER__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub journey: JourneyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which implementation backs the lock, evaluation cache and throttle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Floor for audience-generation lock expiry.
    #[serde(default = "default_min_timeout_secs")]
    pub min_timeout_secs: u64,
    /// Candidate users budgeted per second of lock time.
    #[serde(default = "default_users_per_second")]
    pub users_per_second: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_stream_batch_size")]
    pub stream_batch_size: usize,
    /// Sends per window for providers without their own limit. 0 disables.
    #[serde(default)]
    pub default_rate_limit: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    #[serde(default = "default_journey_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_steps_per_advance")]
    pub max_steps_per_advance: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "worker-01".to_string()
}
fn default_workers() -> usize {
    8
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    3_600_000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_min_timeout_secs() -> u64 {
    900
}
fn default_users_per_second() -> u64 {
    1000
}
fn default_stream_batch_size() -> usize {
    500
}
fn default_rate_window_ms() -> u64 {
    1000
}
fn default_journey_enabled() -> bool {
    true
}
fn default_max_steps_per_advance() -> usize {
    64
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: default_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            min_timeout_secs: default_min_timeout_secs(),
            users_per_second: default_users_per_second(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            stream_batch_size: default_stream_batch_size(),
            default_rate_limit: 0,
            rate_window_ms: default_rate_window_ms(),
        }
    }
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            enabled: default_journey_enabled(),
            max_steps_per_advance: default_max_steps_per_advance(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            workers: default_workers(),
            backend: Backend::default(),
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            lock: LockConfig::default(),
            dispatch: DispatchConfig::default(),
            journey: JourneyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CAMPAIGN_WORKER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
