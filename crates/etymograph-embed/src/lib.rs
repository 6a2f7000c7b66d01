//! Etymograph Embed - batched embedding generation with caching
//!
//! This crate provides the embedding service:
//! - `EmbeddingProvider` trait shared by all backends
//! - `LocalProvider` - Candle + Jina BERT local inference (CPU/Metal/CUDA)
//! - `RemoteProvider` - OpenAI-compatible HTTP endpoints with backoff
//! - `HashEmbedder` - deterministic test/dry-run provider
//! - `CachedEmbedder` - two-level (LRU + shared SQLite) cache wrapper
//!
//! The enrichment pipeline constructs one embedder via [`create_embedder`]
//! and shares it across all workers; providers are immutable after
//! construction.

pub mod cache;
pub mod error;
pub mod factory;
pub mod hashed;
pub mod local;
pub mod provider;
pub mod remote;

// Re-exports for convenience
pub use cache::{CacheStats, CachedEmbedder};
pub use error::{EmbedError, Result};
pub use factory::{create_embedder, EmbedServiceConfig};
pub use hashed::HashEmbedder;
pub use local::{LocalProvider, EMBEDDING_DIM};
pub use provider::{EmbeddingProvider, ProviderKind, ProviderStatus};
pub use remote::{RemoteConfig, RemoteProvider};
