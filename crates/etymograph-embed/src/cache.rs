//! Two-level embedding cache
//!
//! Fronts any [`EmbeddingProvider`] with:
//! (a) an in-memory LRU keyed by a hash of `(model_id, normalized text)`,
//! (b) a shared persistent SQLite key-value cache.
//!
//! On a hit at either level the encoder is skipped; on encode, both levels
//! are populated. Failure of the shared cache logs once and degrades to
//! LRU-only; the encoder path never depends on the cache being healthy.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use etymograph_core::{hex_encode, now_millis};

use crate::error::Result;
use crate::provider::{EmbeddingProvider, ProviderKind, ProviderStatus};

/// Cache hit/miss counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// In-memory LRU hits
    pub lru_hits: u64,
    /// Shared persistent cache hits
    pub shared_hits: u64,
    /// Texts that reached the encoder
    pub misses: u64,
}

impl CacheStats {
    /// Overall hit rate in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let hits = self.lru_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// SQL for the shared cache table
const SHARED_CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embedding_cache (
    key TEXT PRIMARY KEY NOT NULL,
    vector BLOB NOT NULL,
    dim INTEGER NOT NULL,
    created_at INTEGER NOT NULL
)
"#;

/// Caching wrapper around an embedding provider.
///
/// Safe to share across pipeline workers: the LRU sits behind a mutex held
/// only for map operations, never across an await.
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    lru: Mutex<LruCache<String, Vec<f32>>>,
    shared: Option<Mutex<Connection>>,
    /// Set after the first shared-cache failure; we log once and degrade
    shared_degraded: AtomicBool,
    lru_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbedder {
    /// Wrap a provider with an LRU of `lru_capacity` vectors and, when
    /// `shared_path` is given, a persistent shared cache.
    ///
    /// A shared cache that cannot be opened is reported and skipped; the
    /// embedder still works.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        lru_capacity: usize,
        shared_path: Option<&Path>,
    ) -> Self {
        let capacity = NonZeroUsize::new(lru_capacity.max(1)).expect("capacity is non-zero");

        let shared = shared_path.and_then(|path| match open_shared_cache(path) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(e) => {
                warn!("shared embedding cache unavailable, continuing without: {}", e);
                None
            }
        });

        Self {
            provider,
            lru: Mutex::new(LruCache::new(capacity)),
            shared,
            shared_degraded: AtomicBool::new(false),
            lru_hits: AtomicU64::new(0),
            shared_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Current hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lru_hits: self.lru_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Cache key: hash of model id and text, so switching models never
    /// serves stale vectors.
    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.model_id().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(text.as_bytes());
        hex_encode(&hasher.finalize())
    }

    fn shared_get(&self, key: &str) -> Option<Vec<f32>> {
        let shared = self.shared.as_ref()?;
        if self.shared_degraded.load(Ordering::Relaxed) {
            return None;
        }
        let conn = shared.lock();
        match conn
            .query_row(
                "SELECT vector FROM embedding_cache WHERE key = ?1",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        {
            Ok(blob) => blob.map(|b| decode_vector(&b)),
            Err(e) => {
                self.note_shared_failure(&e.to_string());
                None
            }
        }
    }

    fn shared_put(&self, key: &str, vector: &[f32]) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        if self.shared_degraded.load(Ordering::Relaxed) {
            return;
        }
        let conn = shared.lock();
        let result = conn.execute(
            "INSERT OR REPLACE INTO embedding_cache (key, vector, dim, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, encode_vector(vector), vector.len() as i64, now_millis()],
        );
        if let Err(e) = result {
            self.note_shared_failure(&e.to_string());
        }
    }

    fn note_shared_failure(&self, message: &str) {
        if !self.shared_degraded.swap(true, Ordering::Relaxed) {
            warn!("shared embedding cache failed, degrading to LRU-only: {}", message);
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let keys: Vec<String> = texts.iter().map(|t| self.cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();

        // Level 1: in-memory LRU
        {
            let mut lru = self.lru.lock();
            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = lru.get(key) {
                    results[i] = Some(vector.clone());
                    self.lru_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    pending.push(i);
                }
            }
        }

        // Level 2: shared persistent cache
        if !pending.is_empty() && self.shared.is_some() {
            let mut still_pending = Vec::with_capacity(pending.len());
            for i in pending {
                if let Some(vector) = self.shared_get(&keys[i]) {
                    self.shared_hits.fetch_add(1, Ordering::Relaxed);
                    self.lru.lock().put(keys[i].clone(), vector.clone());
                    results[i] = Some(vector);
                } else {
                    still_pending.push(i);
                }
            }
            pending = still_pending;
        }

        // Level 3: the encoder, for whatever is left
        if !pending.is_empty() {
            self.misses
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            debug!(
                "cache miss for {}/{} texts, dispatching to encoder",
                pending.len(),
                texts.len()
            );
            let miss_texts: Vec<String> = pending.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.provider.encode(miss_texts).await?;
            for (&i, vector) in pending.iter().zip(vectors.into_iter()) {
                self.shared_put(&keys[i], &vector);
                self.lru.lock().put(keys[i].clone(), vector.clone());
                results[i] = Some(vector);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every slot filled by cache or encoder"))
            .collect())
    }

    async fn check_status(&self) -> Result<ProviderStatus> {
        self.provider.check_status().await
    }

    async fn warmup(&self) -> Result<()> {
        self.provider.warmup().await
    }

    fn dim(&self) -> usize {
        self.provider.dim()
    }

    fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }
}

fn open_shared_cache(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(SHARED_CACHE_SCHEMA)?;
    Ok(conn)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashed::HashEmbedder;

    fn embedder(shared: Option<&Path>) -> (Arc<HashEmbedder>, CachedEmbedder) {
        let provider = Arc::new(HashEmbedder::new(16));
        let cached = CachedEmbedder::new(provider.clone(), 64, shared);
        (provider, cached)
    }

    #[tokio::test]
    async fn test_lru_hit_skips_encoder() {
        let (provider, cached) = embedder(None);
        let texts = vec!["male parent".to_string(), "female parent".to_string()];

        let first = cached.encode(texts.clone()).await.unwrap();
        assert_eq!(provider.calls(), 1);

        let second = cached.encode(texts).await.unwrap();
        assert_eq!(provider.calls(), 1, "second pass must be all cache hits");
        assert_eq!(first, second);

        let stats = cached.stats();
        assert_eq!(stats.lru_hits, 2);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shared_cache_survives_new_lru() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.db");

        let (provider, cached) = embedder(Some(&cache_path));
        cached.encode(vec!["father".to_string()]).await.unwrap();
        assert_eq!(provider.calls(), 1);
        drop(cached);

        // Fresh process: empty LRU, same shared cache
        let (provider2, cached2) = embedder(Some(&cache_path));
        cached2.encode(vec!["father".to_string()]).await.unwrap();
        assert_eq!(provider2.calls(), 0, "shared cache must satisfy the miss");
        assert_eq!(cached2.stats().shared_hits, 1);
    }

    #[tokio::test]
    async fn test_unopenable_shared_cache_degrades() {
        // A directory path cannot be opened as a database file
        let dir = tempfile::tempdir().unwrap();
        let (provider, cached) = embedder(Some(dir.path()));
        let out = cached.encode(vec!["father".to_string()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_order_preserved_on_mixed_hits() {
        let (_, cached) = embedder(None);
        cached.encode(vec!["b".to_string()]).await.unwrap();

        let out = cached
            .encode(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        let direct = HashEmbedder::new(16);
        let expected = direct
            .encode(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_cache_key_includes_model() {
        let a = CachedEmbedder::new(Arc::new(HashEmbedder::new(8)), 4, None);
        let b = CachedEmbedder::new(
            Arc::new(HashEmbedder::with_model_id(8, "other-model")),
            4,
            None,
        );
        assert_ne!(a.cache_key("father"), b.cache_key("father"));
    }
}
