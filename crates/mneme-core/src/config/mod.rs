//! Configuration management with file persistence
//!
//! Settings live in `config.toml` under `$MNEME_CONFIG_DIR` (or the
//! platform config dir). Graph data defaults to `$MNEME_DATA_DIR` (or the
//! platform data dir). Missing sections and keys take their defaults.
//! API keys are read from the environment only.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

/// Mneme configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheSettings,
    pub embedding: EmbeddingConfig,
    pub vector: VectorConfig,
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(anyhow!("Invalid storage backend: {}. Valid options: file, sqlite", other)),
        }
    }
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub file_path: PathBuf,
    pub database_path: PathBuf,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            backend: StorageBackend::File,
            file_path: data_dir.join("memory.json"),
            database_path: data_dir.join("mneme.db"),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Byte budget for cached search results
    pub max_size_bytes: u64,
    pub default_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic offline embeddings
    Default,
    OpenAi,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value {
            "default" => Ok(Self::Default),
            "openai" => Ok(Self::OpenAi),
            other => Err(anyhow!(
                "Invalid embedding provider: {}. Valid options: default, openai",
                other
            )),
        }
    }
}

impl EmbeddingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimensions: usize,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub api_base: String,
    /// Embedding calls allowed per `interval_ms`
    pub tokens_per_interval: u32,
    pub interval_ms: u64,
    pub batch_size: usize,
    pub process_interval_secs: u64,
    pub max_attempts: u32,
    /// Finished jobs older than this are evicted by the worker
    pub job_retention_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: u64,
    /// Process freshly scheduled jobs right after entity writes
    pub process_on_write: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Default,
            model: "mneme-hash-embedding".to_string(),
            dimensions: 1536,
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            tokens_per_interval: 20,
            interval_ms: 60_000,
            batch_size: 10,
            process_interval_secs: 60,
            max_attempts: 3,
            job_retention_secs: 60 * 60,
            cache_ttl_secs: 30 * 24 * 60 * 60,
            cache_max_entries: 1000,
            process_on_write: false,
        }
    }
}

impl EmbeddingConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("MNEME_OPENAI_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    format!("***{}", &key[key.len() - 4..])
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "Embedding API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub min_similarity: f32,
    pub default_limit: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Upper bound on a single path search; 0 disables the limit
    pub path_timeout_ms: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path_timeout_ms: 5_000,
        }
    }
}

impl AnalyticsConfig {
    pub fn path_timeout(&self) -> Option<Duration> {
        (self.path_timeout_ms > 0).then(|| Duration::from_millis(self.path_timeout_ms))
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var("MNEME_DATA_DIR") {
        return PathBuf::from(custom_dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("mneme"))
        .unwrap_or_else(|| PathBuf::from("."))
}

const KEYS: &[&str] = &[
    "storage.backend",
    "storage.file_path",
    "storage.database_path",
    "storage.max_connections",
    "cache.max_size_bytes",
    "cache.default_ttl_ms",
    "embedding.provider",
    "embedding.model",
    "embedding.dimensions",
    "embedding.api_key",
    "embedding.api_base",
    "embedding.tokens_per_interval",
    "embedding.interval_ms",
    "embedding.batch_size",
    "embedding.process_interval_secs",
    "embedding.max_attempts",
    "embedding.job_retention_secs",
    "embedding.cache_ttl_secs",
    "embedding.cache_max_entries",
    "embedding.process_on_write",
    "vector.min_similarity",
    "vector.default_limit",
    "analytics.path_timeout_ms",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("MNEME_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("mneme")
        };
        Ok(dir)
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if the file is absent
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.embedding.enforce_env_only()?;
        if self.embedding.dimensions == 0 {
            return Err(anyhow!("embedding.dimensions must be greater than zero"));
        }
        if self.embedding.tokens_per_interval == 0 {
            return Err(anyhow!("embedding.tokens_per_interval must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.vector.min_similarity) {
            return Err(anyhow!("vector.min_similarity must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "storage.backend" => self.storage.backend.as_str().to_string(),
            "storage.file_path" => self.storage.file_path.display().to_string(),
            "storage.database_path" => self.storage.database_path.display().to_string(),
            "storage.max_connections" => self.storage.max_connections.to_string(),

            "cache.max_size_bytes" => self.cache.max_size_bytes.to_string(),
            "cache.default_ttl_ms" => self.cache.default_ttl_ms.to_string(),

            "embedding.provider" => self.embedding.provider.as_str().to_string(),
            "embedding.model" => self.embedding.model.clone(),
            "embedding.dimensions" => self.embedding.dimensions.to_string(),
            "embedding.api_base" => self.embedding.api_base.clone(),
            "embedding.tokens_per_interval" => self.embedding.tokens_per_interval.to_string(),
            "embedding.interval_ms" => self.embedding.interval_ms.to_string(),
            "embedding.batch_size" => self.embedding.batch_size.to_string(),
            "embedding.process_interval_secs" => self.embedding.process_interval_secs.to_string(),
            "embedding.max_attempts" => self.embedding.max_attempts.to_string(),
            "embedding.job_retention_secs" => self.embedding.job_retention_secs.to_string(),
            "embedding.cache_ttl_secs" => self.embedding.cache_ttl_secs.to_string(),
            "embedding.cache_max_entries" => self.embedding.cache_max_entries.to_string(),
            "embedding.process_on_write" => self.embedding.process_on_write.to_string(),
            "embedding.api_key" => match self.embedding.redacted_api_key()? {
                Some(redacted) => redacted,
                None => "(not set - use MNEME_OPENAI_API_KEY or OPENAI_API_KEY env var)".to_string(),
            },

            "vector.min_similarity" => self.vector.min_similarity.to_string(),
            "vector.default_limit" => self.vector.default_limit.to_string(),

            "analytics.path_timeout_ms" => self.analytics.path_timeout_ms.to_string(),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `mneme config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "storage.backend" => self.storage.backend = value.parse()?,
            "storage.file_path" => self.storage.file_path = PathBuf::from(value),
            "storage.database_path" => self.storage.database_path = PathBuf::from(value),
            "storage.max_connections" => {
                let max: u32 = parse(key, value)?;
                if max == 0 {
                    return Err(anyhow!("storage.max_connections must be at least 1"));
                }
                self.storage.max_connections = max;
            }

            "cache.max_size_bytes" => self.cache.max_size_bytes = parse(key, value)?,
            "cache.default_ttl_ms" => self.cache.default_ttl_ms = parse(key, value)?,

            "embedding.provider" => self.embedding.provider = value.parse()?,
            "embedding.model" => self.embedding.model = value.to_string(),
            "embedding.dimensions" => {
                let dims: usize = parse(key, value)?;
                if dims == 0 {
                    return Err(anyhow!("embedding.dimensions must be greater than zero"));
                }
                self.embedding.dimensions = dims;
            }
            "embedding.api_base" => self.embedding.api_base = value.trim_end_matches('/').to_string(),
            "embedding.tokens_per_interval" => {
                let tokens: u32 = parse(key, value)?;
                if tokens == 0 {
                    return Err(anyhow!("embedding.tokens_per_interval must be greater than zero"));
                }
                self.embedding.tokens_per_interval = tokens;
            }
            "embedding.interval_ms" => self.embedding.interval_ms = parse(key, value)?,
            "embedding.batch_size" => self.embedding.batch_size = parse(key, value)?,
            "embedding.process_interval_secs" => {
                self.embedding.process_interval_secs = parse(key, value)?
            }
            "embedding.max_attempts" => self.embedding.max_attempts = parse(key, value)?,
            "embedding.job_retention_secs" => self.embedding.job_retention_secs = parse(key, value)?,
            "embedding.cache_ttl_secs" => self.embedding.cache_ttl_secs = parse(key, value)?,
            "embedding.cache_max_entries" => self.embedding.cache_max_entries = parse(key, value)?,
            "embedding.process_on_write" => self.embedding.process_on_write = parse(key, value)?,
            "embedding.api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the MNEME_OPENAI_API_KEY or OPENAI_API_KEY environment variable instead."
                ));
            }

            "vector.min_similarity" => {
                let min: f32 = parse(key, value)?;
                if !(0.0..=1.0).contains(&min) {
                    return Err(anyhow!("vector.min_similarity must be between 0.0 and 1.0"));
                }
                self.vector.min_similarity = min;
            }
            "vector.default_limit" => self.vector.default_limit = parse(key, value)?,

            "analytics.path_timeout_ms" => self.analytics.path_timeout_ms = parse(key, value)?,

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `mneme config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
