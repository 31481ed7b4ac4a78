use std::{env, fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::Result;
use data_model::FrameworkId;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_state_store_path")]
    pub state_store_path: String,
    /// Framework id to query agents with until the scheduler reports one.
    #[serde(default)]
    pub framework_id: Option<FrameworkId>,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub host_sync: HostSyncConfig,
    #[serde(default)]
    pub agent_query_cache: AgentQueryCacheConfig,
    #[serde(default)]
    pub agent: AgentClientConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        SyncerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            state_store_path: default_state_store_path(),
            framework_id: None,
            publisher: Default::default(),
            host_sync: Default::default(),
            agent_query_cache: Default::default(),
            agent: Default::default(),
            telemetry: Default::default(),
        }
    }
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8901".to_string()
}

fn default_state_store_path() -> String {
    env::current_dir()
        .map(|dir| dir.join("sandbox_syncer_storage/state"))
        .unwrap_or_else(|_| "sandbox_syncer_storage/state".into())
        .to_string_lossy()
        .to_string()
}

impl SyncerConfig {
    pub fn from_path(path: &str) -> Result<SyncerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<SyncerConfig> {
        let config: SyncerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.publisher.batch_size == 0 {
            return Err(anyhow::anyhow!("publisher batch_size must be positive"));
        }
        if self.publisher.interval.is_zero() {
            return Err(anyhow::anyhow!("publisher interval_ms must be positive"));
        }
        if self.host_sync.interval.is_zero() {
            return Err(anyhow::anyhow!("host_sync interval_ms must be positive"));
        }
        if self.agent_query_cache.max_size == 0 {
            return Err(anyhow::anyhow!("agent_query_cache max_size must be positive"));
        }
        if self.agent.port == 0 {
            return Err(anyhow::anyhow!("invalid agent port: {}", self.agent.port));
        }
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Maximum number of sandboxes written per durable transaction.
    pub batch_size: usize,
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval: Duration::from_millis(2_500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSyncConfig {
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
    /// Agent hosts marked pending at startup.
    pub hosts: Vec<String>,
}

impl Default for HostSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15_000),
            hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentQueryCacheConfig {
    pub max_size: usize,
    /// Age after which a cached query result is treated as absent and the
    /// agent is queried again on the next lookup. 0 disables expiry.
    /// Defaults to one minute.
    pub ttl_ms: u64,
}

impl AgentQueryCacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }
}

impl Default for AgentQueryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 5_000,
            ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentClientConfig {
    pub port: u16,
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "read_timeout_ms", with = "duration_millis")]
    pub read_timeout: Duration,
    /// Pre-acquired SPNEGO token sent as `Authorization: Negotiate <token>`.
    pub negotiate_token: Option<String>,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            port: 5051,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            negotiate_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable metrics.
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Used as the metric attribute "sandbox_syncer.instance.id".
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

// Serde module for Duration serialization/deserialization
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
