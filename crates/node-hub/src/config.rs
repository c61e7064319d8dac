use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "NODE_HUB";

/// Largest single traffic report accepted from an agent (1 TiB).
pub const DEFAULT_MAX_REPORT_BYTES: i64 = 1 << 40;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub operator: OperatorAuthConfig,
    pub tokens: TokenConfig,
    pub hub: HubConfig,
    pub traffic: TrafficConfig,
    pub quota: QuotaConfig,
    pub releases: ReleaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorAuthConfig {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    pub header_name: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub pepper: String,
}

/// Per-connection protocol limits for agent sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Largest inbound WebSocket frame accepted from an agent.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Session is torn down when no pong arrives within this window.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Keepalive ping cadence; must be shorter than the pong timeout.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Deadline applied to every outbound write.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Outbound frames buffered per session before sends fail fast.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    #[serde(default = "default_max_report_bytes")]
    pub max_report_bytes: i64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub cache_ttl_secs: u64,
    /// Lifetime of the "confirmed absent" marker.
    pub not_found_ttl_secs: u64,
    /// Upper bound for detached enforcement and notification tasks.
    pub task_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// `owner/name` of the agent release repository.
    pub github_repo: String,
    pub api_base: String,
    /// Artifacts are named `{asset_prefix}-{platform}-{arch}`.
    pub asset_prefix: String,
    pub cache_ttl_secs: u64,
    pub batch_max_nodes: usize,
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_pong_timeout_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_send_queue_capacity() -> usize {
    256
}

fn default_max_report_bytes() -> i64 {
    DEFAULT_MAX_REPORT_BYTES
}

fn default_flush_interval_secs() -> u64 {
    10
}

impl HubConfig {
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_bytes == 0 {
            anyhow::bail!("hub.max_frame_bytes must be > 0");
        }
        if self.ping_interval_secs == 0 {
            anyhow::bail!("hub.ping_interval_secs must be > 0");
        }
        if self.pong_timeout_secs <= self.ping_interval_secs {
            anyhow::bail!("hub.pong_timeout_secs must exceed hub.ping_interval_secs");
        }
        if self.write_timeout_secs == 0 {
            anyhow::bail!("hub.write_timeout_secs must be > 0");
        }
        if self.send_queue_capacity == 0 {
            anyhow::bail!("hub.send_queue_capacity must be > 0");
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            pong_timeout_secs: default_pong_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_report_bytes <= 0 {
            anyhow::bail!("traffic.max_report_bytes must be > 0");
        }
        if self.flush_interval_secs == 0 {
            anyhow::bail!("traffic.flush_interval_secs must be > 0");
        }
        Ok(())
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            max_report_bytes: default_max_report_bytes(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache_ttl_secs == 0 || self.not_found_ttl_secs == 0 {
            anyhow::bail!("quota cache TTLs must be > 0");
        }
        if self.task_timeout_secs == 0 {
            anyhow::bail!("quota.task_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            not_found_ttl_secs: 60,
            task_timeout_secs: 30,
        }
    }
}

impl ReleaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.github_repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            anyhow::bail!("releases.github_repo must look like owner/name");
        }
        if self.asset_prefix.trim().is_empty() {
            anyhow::bail!("releases.asset_prefix cannot be empty");
        }
        if self.batch_max_nodes == 0 {
            anyhow::bail!("releases.batch_max_nodes must be > 0");
        }
        Ok(())
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            github_repo: "proxy-fleet/node-agent".into(),
            api_base: "https://api.github.com".into(),
            asset_prefix: "node-agent".into(),
            cache_ttl_secs: 600,
            batch_max_nodes: 1000,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://data/node-hub.db")?
        .set_default("operator.tokens", vec!["dev-operator-token"])?
        .set_default("operator.header_name", "authorization")?
        .set_default("tokens.pepper", "dev-token-pepper")?
        .set_default("hub.max_frame_bytes", default_max_frame_bytes() as u64)?
        .set_default("hub.pong_timeout_secs", default_pong_timeout_secs())?
        .set_default("hub.ping_interval_secs", default_ping_interval_secs())?
        .set_default("hub.write_timeout_secs", default_write_timeout_secs())?
        .set_default("hub.send_queue_capacity", default_send_queue_capacity() as u64)?
        .set_default("traffic.max_report_bytes", default_max_report_bytes())?
        .set_default("traffic.flush_interval_secs", default_flush_interval_secs())?
        .set_default("quota.cache_ttl_secs", 300u64)?
        .set_default("quota.not_found_ttl_secs", 60u64)?
        .set_default("quota.task_timeout_secs", 30u64)?
        .set_default("releases.github_repo", "proxy-fleet/node-agent")?
        .set_default("releases.api_base", "https://api.github.com")?
        .set_default("releases.asset_prefix", "node-agent")?
        .set_default("releases.cache_ttl_secs", 600u64)?
        .set_default("releases.batch_max_nodes", 1000u64)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.operator.tokens = app
        .operator
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if app.operator.tokens.is_empty() {
        anyhow::bail!("operator.tokens cannot be empty");
    }
    app.releases.api_base = app.releases.api_base.trim_end_matches('/').to_string();
    app.hub.validate()?;
    app.traffic.validate()?;
    app.quota.validate()?;
    app.releases.validate()?;
    Ok(app)
}
