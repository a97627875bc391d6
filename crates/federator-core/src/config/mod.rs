//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Federator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retrieval: RetrievalConfig,
    pub services: ServicesConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

/// How sub-queries reach the retrieval service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// One multi-query POST per round, replies delivered through callbacks
    #[default]
    Batched,
    /// One synchronous POST per sub-query, bounded by `max_connections`
    Direct,
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batched => write!(f, "batched"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

impl std::str::FromStr for RetrievalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "batched" => Ok(Self::Batched),
            "direct" => Ok(Self::Direct),
            other => Err(anyhow!("Invalid retrieval mode: {}. Valid options: batched, direct", other)),
        }
    }
}

/// Provenance appended to knowledge edges returned by a direct lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorProvenance {
    pub resource_id: String,
    pub upstream_resource_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub base_url: String,
    pub mode: RetrievalMode,
    /// Address retrieval services post callback replies to
    pub callback_host: String,
    pub batch_size: usize,
    /// Cap on sub-queries per creative query, lookup baseline included
    pub max_queries: usize,
    pub max_connections: usize,
    pub submit_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub direct_timeout_secs: u64,
    pub round_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_reply_results: usize,
    pub aggregator: Option<AggregatorProvenance>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://strider.renci.org/".to_string(),
            mode: RetrievalMode::Batched,
            callback_host: "http://localhost:8080".to_string(),
            batch_size: 100,
            max_queries: 101,
            max_connections: 5,
            submit_timeout_secs: 60,
            sync_timeout_secs: 3600,
            direct_timeout_secs: 300,
            round_timeout_secs: 180,
            idle_timeout_secs: 60,
            max_reply_results: 10_000,
            aggregator: None,
        }
    }
}

impl RetrievalConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Join an endpoint name onto the base address
    pub fn endpoint(&self, name: &str) -> String {
        join_url(&self.base_url, name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub ranker_url: String,
    pub coalesce_url: String,
    pub coalesce_method: String,
    pub nodenorm_url: String,
    pub pathfinder_url: Option<String>,
    pub timeout_secs: u64,
    pub nodenorm_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            ranker_url: "https://aragorn-ranker.renci.org/".to_string(),
            coalesce_url: "https://answercoalesce.renci.org/coalesce/".to_string(),
            coalesce_method: "all".to_string(),
            nodenorm_url: "https://nodenormalization-sri.renci.org/".to_string(),
            pathfinder_url: None,
            timeout_secs: 3600,
            nodenorm_timeout_secs: 120,
        }
    }
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn nodenorm_timeout(&self) -> Duration {
        Duration::from_secs(self.nodenorm_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Infores identity used as primary source of synthesized edges
    pub resource_id: String,
    /// Caller identity folded into creative cache keys
    pub caller: String,
    pub promiscuity_ceiling: usize,
    pub rule_files: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resource_id: "infores:federator".to_string(),
            caller: "federator".to_string(),
            promiscuity_ceiling: 10,
            rule_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
    pub cache_enabled: bool,
    pub stale_job_secs: u64,
    pub inline_payload_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_enabled: true,
            stale_job_secs: 3600,
            inline_payload_limit: 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Resolved data directory (defaults under the platform data dir)
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("federator"))
            .unwrap_or_else(|| PathBuf::from(".federator"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir().join("results_cache.db")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir().join("jobs.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir().join("callback-payloads")
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_secs)
    }
}

/// Append a path segment to a base address, tolerating a missing trailing slash
pub fn join_url(base: &str, segment: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, segment)
    } else {
        format!("{}/{}", base, segment)
    }
}

const CONFIG_KEYS: &[&str] = &[
    "retrieval.base_url",
    "retrieval.mode",
    "retrieval.callback_host",
    "retrieval.batch_size",
    "retrieval.max_queries",
    "retrieval.max_connections",
    "retrieval.round_timeout_secs",
    "retrieval.idle_timeout_secs",
    "services.ranker_url",
    "services.coalesce_url",
    "services.nodenorm_url",
    "services.pathfinder_url",
    "engine.resource_id",
    "engine.caller",
    "engine.promiscuity_ceiling",
    "storage.data_dir",
    "storage.cache_enabled",
    "storage.stale_job_secs",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("FEDERATOR_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("federator")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist.
    /// Environment overrides are applied on top.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply `FEDERATOR_*` environment variables
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(url) = env::var("FEDERATOR_RETRIEVAL_URL") {
            self.retrieval.base_url = url;
        }
        if let Ok(host) = env::var("FEDERATOR_CALLBACK_HOST") {
            self.retrieval.callback_host = host;
        }
        if let Ok(size) = env::var("FEDERATOR_BATCH_SIZE") {
            self.retrieval.batch_size = size
                .parse()
                .with_context(|| format!("Invalid FEDERATOR_BATCH_SIZE: {}", size))?;
        }
        if let Ok(max) = env::var("FEDERATOR_MAX_QUERIES") {
            self.retrieval.max_queries = max
                .parse()
                .with_context(|| format!("Invalid FEDERATOR_MAX_QUERIES: {}", max))?;
        }
        if let Ok(url) = env::var("FEDERATOR_RANKER_URL") {
            self.services.ranker_url = url;
        }
        if let Ok(url) = env::var("FEDERATOR_NODENORM_URL") {
            self.services.nodenorm_url = url;
        }
        if let Ok(dir) = env::var("FEDERATOR_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retrieval.batch_size == 0 {
            return Err(anyhow!("retrieval.batch_size must be at least 1"));
        }
        if self.retrieval.max_connections == 0 {
            return Err(anyhow!("retrieval.max_connections must be at least 1"));
        }
        if self.retrieval.max_queries == 0 {
            return Err(anyhow!("retrieval.max_queries must be at least 1"));
        }
        if self.retrieval.idle_timeout_secs == 0 {
            return Err(anyhow!("retrieval.idle_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "retrieval.base_url" => Ok(self.retrieval.base_url.clone()),
            "retrieval.mode" => Ok(self.retrieval.mode.to_string()),
            "retrieval.callback_host" => Ok(self.retrieval.callback_host.clone()),
            "retrieval.batch_size" => Ok(self.retrieval.batch_size.to_string()),
            "retrieval.max_queries" => Ok(self.retrieval.max_queries.to_string()),
            "retrieval.max_connections" => Ok(self.retrieval.max_connections.to_string()),
            "retrieval.round_timeout_secs" => Ok(self.retrieval.round_timeout_secs.to_string()),
            "retrieval.idle_timeout_secs" => Ok(self.retrieval.idle_timeout_secs.to_string()),

            "services.ranker_url" => Ok(self.services.ranker_url.clone()),
            "services.coalesce_url" => Ok(self.services.coalesce_url.clone()),
            "services.nodenorm_url" => Ok(self.services.nodenorm_url.clone()),
            "services.pathfinder_url" => Ok(self
                .services
                .pathfinder_url
                .clone()
                .unwrap_or_else(|| "(not set)".to_string())),

            "engine.resource_id" => Ok(self.engine.resource_id.clone()),
            "engine.caller" => Ok(self.engine.caller.clone()),
            "engine.promiscuity_ceiling" => Ok(self.engine.promiscuity_ceiling.to_string()),

            "storage.data_dir" => Ok(self.storage.data_dir().display().to_string()),
            "storage.cache_enabled" => Ok(self.storage.cache_enabled.to_string()),
            "storage.stale_job_secs" => Ok(self.storage.stale_job_secs.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `federator config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "retrieval.base_url" => self.retrieval.base_url = value.to_string(),
            "retrieval.mode" => self.retrieval.mode = value.parse()?,
            "retrieval.callback_host" => self.retrieval.callback_host = value.to_string(),
            "retrieval.batch_size" => {
                self.retrieval.batch_size = value
                    .parse()
                    .with_context(|| format!("Invalid batch_size value: {}", value))?;
            }
            "retrieval.max_queries" => {
                self.retrieval.max_queries = value
                    .parse()
                    .with_context(|| format!("Invalid max_queries value: {}", value))?;
            }
            "retrieval.max_connections" => {
                self.retrieval.max_connections = value
                    .parse()
                    .with_context(|| format!("Invalid max_connections value: {}", value))?;
            }
            "retrieval.round_timeout_secs" => {
                self.retrieval.round_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid round_timeout_secs value: {}", value))?;
            }
            "retrieval.idle_timeout_secs" => {
                self.retrieval.idle_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid idle_timeout_secs value: {}", value))?;
            }
            "services.ranker_url" => self.services.ranker_url = value.to_string(),
            "services.coalesce_url" => self.services.coalesce_url = value.to_string(),
            "services.nodenorm_url" => self.services.nodenorm_url = value.to_string(),
            "services.pathfinder_url" => {
                self.services.pathfinder_url = (!value.is_empty()).then(|| value.to_string());
            }
            "engine.resource_id" => self.engine.resource_id = value.to_string(),
            "engine.caller" => self.engine.caller = value.to_string(),
            "engine.promiscuity_ceiling" => {
                self.engine.promiscuity_ceiling = value
                    .parse()
                    .with_context(|| format!("Invalid promiscuity_ceiling value: {}", value))?;
            }
            "storage.data_dir" => self.storage.data_dir = Some(PathBuf::from(value)),
            "storage.cache_enabled" => {
                self.storage.cache_enabled = value
                    .parse()
                    .with_context(|| format!("Invalid cache_enabled value: {}", value))?;
            }
            "storage.stale_job_secs" => {
                self.storage.stale_job_secs = value
                    .parse()
                    .with_context(|| format!("Invalid stale_job_secs value: {}", value))?;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `federator config show` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        CONFIG_KEYS
            .iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}
