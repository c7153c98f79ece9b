// shared-types-rs/src/config.rs
// Centralized configuration loader for Tonecraft

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use resilience::{ErrorKind, LoggingConfig, ServiceError};
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "TONECRAFT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/tonecraft.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ServiceError for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }

    fn service(&self) -> &'static str {
        "config"
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TonecraftConfig {
    pub system: SystemConfig,
    pub logging: LoggingConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub oracle: OracleConfig,
    pub requests: RequestsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub environment: String,
    pub slot_count: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            slot_count: crate::catalog::DEFAULT_SLOT_COUNT,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerBackend {
    /// Inference runs on a tokio task inside the service process
    Task,
    /// Inference runs in a supervised child process
    Process,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub backend: WorkerBackend,
    pub command: String,
    pub args: Vec<String>,
    pub call_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub restart_min_interval_ms: u64,
    pub max_restarts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackend::Task,
            command: "tonecraft-worker".to_string(),
            args: Vec::new(),
            call_timeout_ms: 10_000,
            monitor_interval_ms: 250,
            restart_min_interval_ms: 1_000,
            max_restarts: 5,
        }
    }
}

impl WorkerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn restart_min_interval(&self) -> Duration {
        Duration::from_millis(self.restart_min_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    pub corpus_path: Option<PathBuf>,
    pub top_k: usize,
    pub tag_block_width: usize,
    pub similarity_weight: f32,
    pub match_weight: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            top_k: 5,
            tag_block_width: 64,
            similarity_weight: 1.0,
            match_weight: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestsConfig {
    pub max_stage_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub stuck_timeout_secs: u64,
    pub retention_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            max_stage_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 5_000,
            stuck_timeout_secs: 120,
            retention_secs: 86_400,
            maintenance_interval_secs: 30,
        }
    }
}

impl RequestsConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            dir: PathBuf::from("data/requests"),
        }
    }
}

impl TonecraftConfig {
    /// Load configuration from `TONECRAFT_CONFIG`, or the default path.
    ///
    /// A missing default file yields the built-in defaults; a missing file
    /// named explicitly through the environment is an error.
    pub fn load() -> Result<TonecraftConfig, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(DEFAULT_CONFIG_PATH)?
            }
            Err(_) => {
                tracing::debug!(path = DEFAULT_CONFIG_PATH, "No config file, using defaults");
                TonecraftConfig::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<TonecraftConfig, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<TonecraftConfig, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `TONECRAFT_*` overrides supplied by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("TONECRAFT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("TONECRAFT_LOG_JSON") {
            self.logging.json_format = parse_value("TONECRAFT_LOG_JSON", &json)?;
        }
        if let Some(path) = lookup("TONECRAFT_CORPUS") {
            self.oracle.corpus_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("TONECRAFT_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(command) = lookup("TONECRAFT_WORKER_COMMAND") {
            self.worker.command = command;
            self.worker.backend = WorkerBackend::Process;
        }
        if let Some(ttl) = lookup("TONECRAFT_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_value("TONECRAFT_CACHE_TTL_SECS", &ttl)?;
        }
        if let Some(threshold) = lookup("TONECRAFT_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = parse_value("TONECRAFT_BREAKER_THRESHOLD", &threshold)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.slot_count == 0 {
            return Err(ConfigError::InvalidValue("system.slot_count must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.oracle.top_k == 0 || self.oracle.tag_block_width == 0 {
            return Err(ConfigError::InvalidValue(
                "oracle.top_k and oracle.tag_block_width must be > 0".into(),
            ));
        }
        if self.oracle.match_weight <= self.oracle.similarity_weight {
            return Err(ConfigError::InvalidValue(
                "oracle.match_weight must dominate oracle.similarity_weight".into(),
            ));
        }
        if self.worker.monitor_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "worker.monitor_interval_ms must be > 0".into(),
            ));
        }
        if self.requests.maintenance_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "requests.maintenance_interval_secs must be > 0".into(),
            ));
        }
        if self.requests.max_stage_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "requests.max_stage_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}")))
}
