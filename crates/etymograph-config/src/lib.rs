//! Etymograph Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.etymograph/config.toml`
//! - Local config: `.etymograph/config.toml` (in working directory)
//! - CLI overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → CLI overrides.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for Etymograph.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EtymographConfig {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Embedding provider configuration
    pub embedding: EmbeddingConfig,

    /// Pipeline tuning
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl EtymographConfig {
    /// Apply CLI overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref dir) = overrides.data_dir {
            self.storage.data_dir = dir.clone();
        }
        if let Some(ref url) = overrides.qdrant_url {
            self.storage.qdrant.url = url.clone();
        }
        if let Some(provider) = overrides.embedding_provider {
            self.embedding.provider = provider;
        }
        if let Some(workers) = overrides.workers {
            self.pipeline.cleaner_workers = workers;
        }
        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.embedding.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}

/// Storage configuration: SQLite data directory and Qdrant endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for Etymograph data (default: `.etymograph`)
    pub data_dir: PathBuf,

    /// Qdrant configuration for the entry vector index
    pub qdrant: QdrantSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".etymograph"),
            qdrant: QdrantSettings::default(),
        }
    }
}

impl StorageConfig {
    /// Path of the main SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("etymograph.db")
    }

    /// Path of the shared embedding cache database.
    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join("embedding-cache.db")
    }
}

/// Qdrant vector database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantSettings {
    /// Qdrant server URL
    pub url: String,

    /// API key for authentication (optional)
    pub api_key: Option<String>,

    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl Default for QdrantSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Embedding provider configuration.
///
/// # Example TOML
///
/// ```toml
/// [embedding]
/// provider = "local"  # or "remote"
///
/// [embedding.remote]
/// url = "https://api.openai.com/v1"
/// api_key_env = "OPENAI_API_KEY"
/// model = "text-embedding-3-small"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which embedding provider to use
    pub provider: EmbeddingProviderType,

    /// Remote provider settings (required when provider = "remote")
    pub remote: Option<RemoteSettings>,

    /// In-memory LRU cache capacity (vectors)
    pub lru_capacity: usize,

    /// Enable the shared persistent cache
    pub shared_cache: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Local,
            remote: None,
            lru_capacity: 100_000,
            shared_cache: true,
        }
    }
}

impl EmbeddingConfig {
    /// Validate that required settings exist for the selected provider.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.provider {
            EmbeddingProviderType::Local => Ok(()),
            EmbeddingProviderType::Remote => {
                let Some(settings) = self.remote.as_ref() else {
                    return Err(ConfigError::ValidationError(
                        "embedding.provider is 'remote' but [embedding.remote] section is missing"
                            .to_string(),
                    ));
                };
                if settings.url.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "embedding.remote.url is required".to_string(),
                    ));
                }
                if settings.model.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "embedding.remote.model is required".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Embedding provider type selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderType {
    /// Local provider using Candle with Jina models (default)
    #[default]
    Local,
    /// OpenAI-compatible API
    Remote,
}

impl std::fmt::Display for EmbeddingProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for EmbeddingProviderType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "openai" => Ok(Self::Remote),
            _ => Err(ConfigError::ValidationError(format!(
                "Unknown embedding provider: '{}'. Valid values: local, remote",
                s
            ))),
        }
    }
}

/// OpenAI-compatible provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// API base URL (e.g., "https://api.openai.com/v1")
    pub url: String,

    /// Environment variable name containing the API key
    pub api_key_env: Option<String>,

    /// Embedding model name
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retry attempts
    pub max_retries: u32,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            model: "text-embedding-3-small".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Pipeline tuning: batch sizes, worker counts and queue capacities.
///
/// The defaults match sustained bulk throughput on commodity hardware;
/// queue capacities default to 2× the feeding stage's batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Records per file-read batch
    pub load_batch: usize,

    /// Records per raw-store write batch
    pub raw_write_batch: usize,

    /// Drafts per cleaning batch
    pub clean_batch: usize,

    /// Entries per typed-store write batch
    pub write_batch: usize,

    /// Cleaner workers (0 = number of CPU cores)
    pub cleaner_workers: usize,

    /// Texts per embedding batch
    pub embed_batch: usize,

    /// Typed-store writer workers
    pub writers: usize,

    /// Checkpoint interval in records
    pub checkpoint_interval: usize,

    /// Idle flush timeout for partial batches, in milliseconds
    pub batch_idle_ms: u64,

    /// Per-stage error-rate abort threshold over the sliding window
    pub max_error_rate: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            load_batch: 20_000,
            raw_write_batch: 10_000,
            clean_batch: 5_000,
            write_batch: 10_000,
            cleaner_workers: 0,
            embed_batch: 512,
            writers: 2,
            checkpoint_interval: 50_000,
            batch_idle_ms: 200,
            max_error_rate: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Effective cleaner worker count.
    pub fn effective_cleaner_workers(&self) -> usize {
        if self.cleaner_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.cleaner_workers
        }
    }

    /// Queue capacity for a channel fed in batches of `batch`.
    pub fn queue_capacity(&self, batch: usize) -> usize {
        (batch * 2).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load_batch == 0
            || self.raw_write_batch == 0
            || self.clean_batch == 0
            || self.write_batch == 0
        {
            return Err(ConfigError::ValidationError(
                "pipeline batch sizes must be > 0".to_string(),
            ));
        }
        if self.embed_batch == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.embed_batch must be > 0".to_string(),
            ));
        }
        if self.writers == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.writers must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ConfigError::ValidationError(
                "pipeline.max_error_rate must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// CLI overrides, applied after global and local config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override Etymograph data directory
    pub data_dir: Option<PathBuf>,

    /// Override Qdrant URL
    pub qdrant_url: Option<String>,

    /// Override embedding provider type
    pub embedding_provider: Option<EmbeddingProviderType>,

    /// Override cleaner worker count
    pub workers: Option<usize>,

    /// Override log level
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EtymographConfig::default().validate().is_ok());
    }

    #[test]
    fn test_remote_provider_requires_settings() {
        let config = EtymographConfig {
            embedding: EmbeddingConfig {
                provider: EmbeddingProviderType::Remote,
                remote: None,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = EtymographConfig::default();
        config.apply_overrides(&ConfigOverrides {
            qdrant_url: Some("http://qdrant:6334".to_string()),
            workers: Some(8),
            ..Default::default()
        });
        assert_eq!(config.storage.qdrant.url, "http://qdrant:6334");
        assert_eq!(config.pipeline.cleaner_workers, 8);
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!(
            "remote".parse::<EmbeddingProviderType>().unwrap(),
            EmbeddingProviderType::Remote
        );
        assert!("quantum".parse::<EmbeddingProviderType>().is_err());
    }

    #[test]
    fn test_pipeline_validation_bounds() {
        let mut pipeline = PipelineConfig::default();
        pipeline.max_error_rate = 1.5;
        assert!(pipeline.validate().is_err());
        pipeline.max_error_rate = 0.5;
        pipeline.writers = 0;
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig::default();
        assert!(storage.database_path().ends_with("etymograph.db"));
        assert!(storage
            .embedding_cache_path()
            .ends_with("embedding-cache.db"));
    }
}
