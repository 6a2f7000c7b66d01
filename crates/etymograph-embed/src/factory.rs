//! Provider factory
//!
//! Creates the configured embedding provider and wraps it in the two-level
//! cache. The returned `Arc<dyn EmbeddingProvider>` is what pipelines share
//! across their workers.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::cache::CachedEmbedder;
use crate::error::Result;
use crate::hashed::HashEmbedder;
use crate::local::LocalProvider;
use crate::provider::{EmbeddingProvider, ProviderKind};
use crate::remote::{RemoteConfig, RemoteProvider};

/// Configuration for building an embedding service
#[derive(Debug, Clone)]
pub struct EmbedServiceConfig {
    /// Which provider to use
    pub kind: ProviderKind,
    /// Remote provider settings (used when kind = Remote)
    pub remote: Option<RemoteConfig>,
    /// In-memory LRU capacity (vectors)
    pub lru_capacity: usize,
    /// Shared persistent cache location; `None` disables the second level
    pub shared_cache_path: Option<PathBuf>,
}

impl Default for EmbedServiceConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            remote: None,
            lru_capacity: 100_000,
            shared_cache_path: None,
        }
    }
}

/// Build the configured provider behind the cache layer.
pub fn create_embedder(config: &EmbedServiceConfig) -> Result<Arc<CachedEmbedder>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.kind {
        ProviderKind::Local => Arc::new(LocalProvider::new()),
        ProviderKind::Remote => {
            let remote_config = config.remote.clone().unwrap_or_else(RemoteConfig::ollama);
            Arc::new(RemoteProvider::new(remote_config)?)
        }
        ProviderKind::Hashed => Arc::new(HashEmbedder::new(etymograph_core::EMBEDDING_DIM)),
    };

    info!(
        "embedding provider: {} (model={}, dim={})",
        provider.kind(),
        provider.model_id(),
        provider.dim()
    );

    Ok(Arc::new(CachedEmbedder::new(
        provider,
        config.lru_capacity,
        config.shared_cache_path.as_deref(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hashed_embedder() {
        let config = EmbedServiceConfig {
            kind: ProviderKind::Hashed,
            ..Default::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.kind(), ProviderKind::Hashed);
        assert_eq!(embedder.dim(), etymograph_core::EMBEDDING_DIM);
    }
}
