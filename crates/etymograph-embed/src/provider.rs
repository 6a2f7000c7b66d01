//! Embedding provider trait and types
//!
//! Defines the core abstraction for embedding generation with multiple
//! provider implementations:
//! - `LocalProvider` - Candle-based local inference (CPU/Metal/CUDA)
//! - `RemoteProvider` - OpenAI-compatible APIs
//! - `HashEmbedder` - deterministic test double
//!
//! Providers are immutable after construction and shared across pipeline
//! workers behind an `Arc`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Type of embedding provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Local inference using Candle (CPU/Metal/CUDA)
    #[default]
    Local,
    /// OpenAI-compatible API
    Remote,
    /// Deterministic hash embedder (tests and dry runs)
    Hashed,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Remote => write!(f, "remote"),
            ProviderKind::Hashed => write!(f, "hashed"),
        }
    }
}

/// Status of an embedding provider
///
/// Contains health and capability information for diagnostics.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    /// Whether the provider is available and responding
    pub available: bool,
    /// Type of provider
    pub kind: ProviderKind,
    /// Device/endpoint being used ("CPU", "Metal", "CUDA", "Remote")
    pub device: String,
    /// Last health check latency in milliseconds
    pub latency_ms: Option<u64>,
    /// Whether the model is loaded and ready
    pub model_ready: bool,
    /// Error message if provider is unavailable
    pub error: Option<String>,
}

impl ProviderStatus {
    /// Create a status for a healthy provider
    pub fn healthy(kind: ProviderKind, device: impl Into<String>) -> Self {
        Self {
            available: true,
            kind,
            device: device.into(),
            latency_ms: None,
            model_ready: true,
            error: None,
        }
    }

    /// Create a status for an unavailable provider
    pub fn unavailable(kind: ProviderKind, error: impl Into<String>) -> Self {
        Self {
            available: false,
            kind,
            device: "N/A".into(),
            latency_ms: None,
            model_ready: false,
            error: Some(error.into()),
        }
    }

    /// Set latency from a health check
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Embedding provider trait
///
/// Core abstraction for generating dense vectors from text. All methods are
/// async to support both local (spawn_blocking) and remote (HTTP)
/// providers.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the enrichment pipeline shares
/// one provider across all of its workers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts.
    ///
    /// Returns one vector per input, in input order, each with `dim()`
    /// dimensions.
    async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Check provider connectivity and status.
    async fn check_status(&self) -> Result<ProviderStatus>;

    /// Warm up the provider (preload models, establish connections).
    async fn warmup(&self) -> Result<()>;

    /// The dimensionality of generated embeddings.
    fn dim(&self) -> usize;

    /// Identifier of the underlying model, part of cache keys.
    fn model_id(&self) -> &str;

    /// Provider type identifier.
    fn kind(&self) -> ProviderKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::Local.to_string(), "local");
        assert_eq!(ProviderKind::Remote.to_string(), "remote");
        assert_eq!(ProviderKind::Hashed.to_string(), "hashed");
    }

    #[test]
    fn test_provider_status_healthy() {
        let status = ProviderStatus::healthy(ProviderKind::Local, "CPU");
        assert!(status.available);
        assert!(status.model_ready);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_provider_status_unavailable_with_latency() {
        let status =
            ProviderStatus::unavailable(ProviderKind::Remote, "connection refused").with_latency(42);
        assert!(!status.available);
        assert_eq!(status.latency_ms, Some(42));
        assert_eq!(status.error.as_deref(), Some("connection refused"));
    }
}
