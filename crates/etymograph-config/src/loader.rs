//! Configuration loader with inheritance support.
//!
//! Loads configuration from multiple sources and merges them:
//! 1. Global config: `~/.etymograph/config.toml`
//! 2. Local config: `.etymograph/config.toml` (in working directory)
//! 3. CLI overrides
//!
//! Later sources override earlier ones. Merging is file-level per section:
//! a section present in a later file replaces that section wholesale, which
//! keeps the merge predictable without per-field default probing.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::{ConfigOverrides, EtymographConfig};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config directory name, both global (under `$HOME`) and local.
const CONFIG_DIR: &str = ".etymograph";

/// Partial configuration as read from one file: every section optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PartialConfig {
    storage: Option<crate::StorageConfig>,
    embedding: Option<crate::EmbeddingConfig>,
    pipeline: Option<crate::PipelineConfig>,
    logging: Option<crate::LoggingConfig>,
}

/// Configuration loader with inheritance support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (e.g., `~/.etymograph`)
    global_config_dir: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    ///
    /// Automatically detects the global config directory (`~/.etymograph`).
    pub fn new() -> Self {
        Self {
            global_config_dir: dirs::home_dir().map(|h| h.join(CONFIG_DIR)),
        }
    }

    /// Create a loader with a custom global config directory.
    ///
    /// Useful for testing.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
        }
    }

    /// Get the global config file path.
    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    /// Get the local config file path for a working directory.
    pub fn local_config_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a working directory with optional CLI
    /// overrides. Merges config in order: global → local → overrides.
    pub fn load(
        &self,
        workdir: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<EtymographConfig, ConfigError> {
        let mut config = EtymographConfig::default();

        if let Some(global_path) = self.global_config_path() {
            if let Some(partial) = read_partial(&global_path)? {
                debug!("applying global config from {:?}", global_path);
                apply_partial(&mut config, partial);
            }
        }

        let local_path = self.local_config_path(workdir);
        if let Some(partial) = read_partial(&local_path)? {
            debug!("applying local config from {:?}", local_path);
            apply_partial(&mut config, partial);
        }

        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }

        config.validate()?;
        Ok(config)
    }
}

fn read_partial(path: &Path) -> Result<Option<PartialConfig>, ConfigError> {
    if !path.exists() {
        trace!("config not found at {:?}", path);
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    let partial: PartialConfig =
        toml::from_str(&content).map_err(|e| ConfigError::parse_toml(path, e))?;
    Ok(Some(partial))
}

fn apply_partial(config: &mut EtymographConfig, partial: PartialConfig) {
    if let Some(storage) = partial.storage {
        config.storage = storage;
    }
    if let Some(embedding) = partial.embedding {
        config.embedding = embedding;
    }
    if let Some(pipeline) = partial.pipeline {
        config.pipeline = pipeline;
    }
    if let Some(logging) = partial.logging {
        config.logging = logging;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, content: &str) {
        let config_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let mut f = std::fs::File::create(config_dir.join(CONFIG_FILE_NAME)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_defaults_when_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_global_dir(tmp.path().join("nope"));
        let config = loader.load(tmp.path(), None).unwrap();
        assert_eq!(config.pipeline.embed_batch, 512);
    }

    #[test]
    fn test_local_overrides_global() {
        let global = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(global.path().join("g")).unwrap();
        let global_dir = global.path().join("g");
        std::fs::write(
            global_dir.join(CONFIG_FILE_NAME),
            "[pipeline]\nembed_batch = 128\nwriters = 4\n",
        )
        .unwrap();
        write_config(local.path(), "[pipeline]\nembed_batch = 256\n");

        let loader = ConfigLoader::with_global_dir(global_dir);
        let config = loader.load(local.path(), None).unwrap();
        // Local section replaces the global section wholesale
        assert_eq!(config.pipeline.embed_batch, 256);
        assert_eq!(config.pipeline.writers, 2);
    }

    #[test]
    fn test_overrides_win() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "[storage.qdrant]\nurl = \"http://a:6334\"\n");
        let loader = ConfigLoader::with_global_dir(tmp.path().join("none"));
        let overrides = ConfigOverrides {
            qdrant_url: Some("http://b:6334".to_string()),
            ..Default::default()
        };
        let config = loader.load(tmp.path(), Some(&overrides)).unwrap();
        assert_eq!(config.storage.qdrant.url, "http://b:6334");
    }

    #[test]
    fn test_bad_toml_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "not valid toml [");
        let loader = ConfigLoader::with_global_dir(tmp.path().join("none"));
        assert!(loader.load(tmp.path(), None).is_err());
    }
}
