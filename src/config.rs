use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::{IngestError, Result};

/// Top-level process configuration: compiled-in defaults, optionally
/// overridden by a YAML file, then by environment variables (`INGESTOR_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            store: StoreConfig::default(),
            discovery: DiscoveryConfig::default(),
            aggregator: AggregatorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_chat_batch_size")]
    pub chat_batch_size: usize,
    #[serde(default = "default_gift_batch_size")]
    pub gift_batch_size: usize,
    #[serde(default = "default_stat_batch_size")]
    pub stat_batch_size: usize,
    #[serde(default = "default_buffer_timeout_secs")]
    pub buffer_timeout_secs: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            chat_batch_size: default_chat_batch_size(),
            gift_batch_size: default_gift_batch_size(),
            stat_batch_size: default_stat_batch_size(),
            buffer_timeout_secs: default_buffer_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_mongo_url")]
    pub mongo_url: String,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_zombie_timeout_secs")]
    pub zombie_timeout_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mongo_url: default_mongo_url(),
            db_name: default_db_name(),
            zombie_timeout_secs: default_zombie_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// `sec_user_id` of the operator account whose follow list is walked.
    /// Empty by default — operators are expected to supply this via the
    /// config file or `INGESTOR_ACCOUNT_SEC_UID`.
    #[serde(default)]
    pub account_sec_uid: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_discovery_interval_secs(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            account_sec_uid: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_combo_timeout_secs")]
    pub combo_timeout_secs: i64,
    #[serde(default = "default_dedup_cap")]
    pub dedup_cap: usize,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_small_gift_threshold")]
    pub small_gift_threshold: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            combo_timeout_secs: default_combo_timeout_secs(),
            dedup_cap: default_dedup_cap(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            small_gift_threshold: default_small_gift_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_chat_batch_size() -> usize {
    500
}
fn default_gift_batch_size() -> usize {
    500
}
fn default_stat_batch_size() -> usize {
    100
}
fn default_buffer_timeout_secs() -> i64 {
    5
}
fn default_mongo_url() -> String {
    "mongodb://127.0.0.1:27017".into()
}
fn default_db_name() -> String {
    "webcast_ingestor".into()
}
fn default_zombie_timeout_secs() -> i64 {
    180
}
fn default_discovery_interval_secs() -> u64 {
    20
}
fn default_page_size() -> u32 {
    20
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_max_buffer_size() -> usize {
    10_000
}
fn default_combo_timeout_secs() -> i64 {
    10
}
fn default_dedup_cap() -> usize {
    1000
}
fn default_dedup_ttl_secs() -> u64 {
    600
}
fn default_small_gift_threshold() -> i64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

impl IngestorConfig {
    /// Load from a YAML file, falling back to defaults for any field the
    /// file omits (every field carries a `#[serde(default)]`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("reading config file: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| IngestError::Config(format!("parsing config file: {e}")))
    }

    /// Apply `INGESTOR_*` environment variable overrides on top of whatever
    /// was loaded from file/defaults. Mirrors the teacher's env-override
    /// pattern in `main.rs`: best-effort parse, ignore on failure.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("INGESTOR_REDIS_URL") {
            self.buffer.redis_url = v;
        }
        if let Ok(v) = std::env::var("INGESTOR_MONGO_URL") {
            self.store.mongo_url = v;
        }
        if let Ok(v) = std::env::var("INGESTOR_DB_NAME") {
            self.store.db_name = v;
        }
        if let Ok(v) = std::env::var("INGESTOR_DISCOVERY_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.discovery.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("INGESTOR_ZOMBIE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.store.zombie_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("INGESTOR_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("INGESTOR_LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Ok(v) = std::env::var("INGESTOR_ACCOUNT_SEC_UID") {
            self.discovery.account_sec_uid = v;
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!("config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = IngestorConfig::default();
        assert_eq!(config.buffer.chat_batch_size, 500);
        assert_eq!(config.buffer.gift_batch_size, 500);
        assert_eq!(config.buffer.stat_batch_size, 100);
        assert_eq!(config.buffer.buffer_timeout_secs, 5);
        assert_eq!(config.discovery.interval_secs, 20);
        assert_eq!(config.store.zombie_timeout_secs, 180);
        assert_eq!(config.aggregator.max_buffer_size, 10_000);
        assert_eq!(config.aggregator.combo_timeout_secs, 10);
        assert_eq!(config.aggregator.small_gift_threshold, 60);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = IngestorConfig::load("/nonexistent/path/config.yml").unwrap();
        assert_eq!(config.store.db_name, "webcast_ingestor");
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let yaml = "store:\n  db_name: custom_db\n";
        let config: IngestorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.db_name, "custom_db");
        assert_eq!(config.buffer.chat_batch_size, 500);
    }
}
