//! Deterministic hash embedder
//!
//! Maps each text to a unit vector derived from its SHA-256 digest. No
//! semantics, but fully deterministic and instant, which makes it the
//! provider of choice for pipeline tests, dry runs and throughput
//! benchmarks. Identical texts always produce identical vectors.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::provider::{EmbeddingProvider, ProviderKind, ProviderStatus};

/// Deterministic test/dry-run embedding provider.
pub struct HashEmbedder {
    dim: usize,
    model_id: String,
    /// Number of encode calls that reached this provider
    calls: AtomicU64,
}

impl HashEmbedder {
    /// Create with the given dimensionality.
    pub fn new(dim: usize) -> Self {
        Self::with_model_id(dim, "hash-embedder-v1")
    }

    /// Create with an explicit model id (distinct cache namespaces).
    pub fn with_model_id(dim: usize, model_id: impl Into<String>) -> Self {
        Self {
            dim: dim.max(1),
            model_id: model_id.into(),
            calls: AtomicU64::new(0),
        }
    }

    /// How many encode calls reached the provider (cache tests).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // Expand the digest with a counter until the dimension is filled.
        let mut out = Vec::with_capacity(self.dim);
        let mut counter = 0u32;
        while out.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(self.model_id.as_bytes());
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            for chunk in hasher.finalize().chunks_exact(4) {
                if out.len() >= self.dim {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }

        // L2 normalize so cosine behaves like the real providers
        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    async fn check_status(&self) -> Result<ProviderStatus> {
        Ok(ProviderStatus::healthy(ProviderKind::Hashed, "CPU"))
    }

    async fn warmup(&self) -> Result<()> {
        Ok(())
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Hashed
    }
}
