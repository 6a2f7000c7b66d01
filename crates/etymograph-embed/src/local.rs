//! Local embedding provider
//!
//! Runs jina-embeddings-v2-base-en (768 dimensions) in-process through
//! Candle. The model loads lazily on first use: the three artifacts resolve
//! through the hf-hub cache (downloading only what is missing), the
//! tokenizer is configured for batch padding once at load, and every
//! forward pass works on bounded chunks so a 512-text pipeline batch never
//! spikes tensor memory.
//!
//! GPU acceleration via compile-time features:
//! - `--features metal` for macOS Metal/MPS
//! - `--features cuda` for NVIDIA CUDA

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::jina_bert::{BertModel, Config as JinaConfig};
use hf_hub::api::sync::Api;
use hf_hub::{Cache, Repo, RepoType};
use once_cell::sync::OnceCell;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};
use tracing::{debug, info};

use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, ProviderKind, ProviderStatus};

/// Embedding dimension of the Jina base model
pub const EMBEDDING_DIM: usize = 768;

/// Model on HuggingFace Hub
const MODEL_ID: &str = "jinaai/jina-embeddings-v2-base-en";

/// The artifacts one Jina BERT checkpoint consists of
const MODEL_FILES: [&str; 3] = ["config.json", "tokenizer.json", "model.safetensors"];

/// Texts per forward pass. Pipeline batches can be 512; the device sees at
/// most this many sequences at once.
const FORWARD_CHUNK: usize = 64;

/// Local embedding provider using Candle for inference
///
/// Cloning shares the inner state, which is what `spawn_blocking` needs to
/// move the provider into a blocking task. The encoder itself sits behind
/// a `OnceCell` and is never mutated after it loads.
#[derive(Clone)]
pub struct LocalProvider {
    inner: Arc<ProviderState>,
}

struct ProviderState {
    encoder: OnceCell<JinaEncoder>,
    device: Device,
}

impl LocalProvider {
    /// Create a provider on the best available device (Metal > CUDA > CPU).
    pub fn new() -> Self {
        Self::with_device(pick_device())
    }

    /// Create with a specific device
    pub fn with_device(device: Device) -> Self {
        Self {
            inner: Arc::new(ProviderState {
                encoder: OnceCell::new(),
                device,
            }),
        }
    }

    /// Get the device being used
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    fn device_label(&self) -> &'static str {
        match &self.inner.device {
            Device::Cpu => "CPU",
            #[cfg(feature = "metal")]
            Device::Metal(_) => "Metal",
            #[cfg(feature = "cuda")]
            Device::Cuda(_) => "CUDA",
            #[allow(unreachable_patterns)]
            _ => "Unknown",
        }
    }

    /// Whether the encoder has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.inner.encoder.get().is_some()
    }

    fn encoder(&self) -> Result<&JinaEncoder> {
        self.inner
            .encoder
            .get_or_try_init(|| JinaEncoder::load(&self.inner.device))
    }

    /// Synchronous encoding; dispatched via `spawn_blocking` from the
    /// async trait surface.
    fn encode_sync(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let encoder = self.encoder()?;

        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(FORWARD_CHUNK) {
            debug!("embedding chunk of {} texts", chunk.len());
            let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
            vectors.extend(encoder.encode_chunk(&refs)?);
        }
        Ok(vectors)
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || provider.encode_sync(&texts))
            .await
            .map_err(|e| EmbedError::Embedding(format!("blocking task panicked: {}", e)))?
    }

    async fn check_status(&self) -> Result<ProviderStatus> {
        let loaded = self.is_loaded();
        // An offline cache probe is enough: a loaded model is trivially
        // available, and cached artifacts mean loading will succeed
        // without network access.
        let available = loaded || artifacts_cached();

        Ok(ProviderStatus {
            available,
            kind: ProviderKind::Local,
            device: self.device_label().to_string(),
            latency_ms: None,
            model_ready: loaded,
            error: (!available).then(|| format!("model '{}' not downloaded yet", MODEL_ID)),
        })
    }

    async fn warmup(&self) -> Result<()> {
        let provider = self.clone();
        let start = Instant::now();

        tokio::task::spawn_blocking(move || provider.encoder().map(|_| ()))
            .await
            .map_err(|e| EmbedError::Embedding(format!("warmup task panicked: {}", e)))??;

        info!("LocalProvider warmup complete in {:?}", start.elapsed());
        Ok(())
    }

    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }
}

/// Best available device; falls through to CPU when no GPU feature is
/// compiled in or the device refuses to initialize.
fn pick_device() -> Device {
    #[cfg(feature = "metal")]
    if let Ok(device) = Device::new_metal(0) {
        info!("embedding on Metal");
        return device;
    }
    #[cfg(feature = "cuda")]
    if let Ok(device) = Device::new_cuda(0) {
        info!("embedding on CUDA");
        return device;
    }
    info!("embedding on CPU");
    Device::Cpu
}

/// Whether every model artifact is already in the local hub cache.
fn artifacts_cached() -> bool {
    let cache = Cache::default().repo(Repo::new(MODEL_ID.to_string(), RepoType::Model));
    MODEL_FILES.iter().all(|&name| cache.get(name).is_some())
}

/// Resolved paths of the checkpoint artifacts.
struct ModelArtifacts {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelArtifacts {
    /// Resolve all artifacts through the hub, downloading whatever the
    /// cache is missing.
    fn fetch(model_id: &str) -> Result<Self> {
        let api = Api::new().map_err(|e| {
            EmbedError::ProviderUnavailable(format!("HuggingFace hub unreachable: {}", e))
        })?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let mut resolved = MODEL_FILES.iter().map(|&name| {
            repo.get(name).map_err(|e| {
                EmbedError::Embedding(format!("model artifact '{}' unavailable: {}", name, e))
            })
        });

        Ok(Self {
            config: resolved.next().expect("config artifact listed")?,
            tokenizer: resolved.next().expect("tokenizer artifact listed")?,
            weights: resolved.next().expect("weights artifact listed")?,
        })
    }
}

/// The loaded encoder: Jina BERT plus a padding-configured tokenizer.
struct JinaEncoder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl JinaEncoder {
    fn load(device: &Device) -> Result<Self> {
        info!("loading embedding model {}", MODEL_ID);
        let artifacts = ModelArtifacts::fetch(MODEL_ID)?;

        let config: JinaConfig = serde_json::from_slice(&std::fs::read(&artifacts.config)?)?;

        // Padding set once here; encode_chunk then pads every batch to its
        // longest sequence without touching tokenizer state again.
        let mut tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
            .map_err(|e| EmbedError::Embedding(format!("cannot load tokenizer: {}", e)))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        let weights = unsafe {
            VarBuilder::from_mmaped_safetensors(&[artifacts.weights], DType::F32, device)?
        };
        let model = BertModel::new(weights, &config)?;

        info!("embedding model ready (dim={})", EMBEDDING_DIM);
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// One forward pass: tokenize, embed, masked-mean, unit-normalize.
    fn encode_chunk(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbedError::Embedding(format!("tokenization failed: {}", e)))?;

        let mut id_rows = Vec::with_capacity(encodings.len());
        let mut mask_rows = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            id_rows.push(Tensor::new(encoding.get_ids(), &self.device)?);
            mask_rows.push(Tensor::new(encoding.get_attention_mask(), &self.device)?);
        }
        let token_ids = Tensor::stack(&id_rows, 0)?;
        let mask = Tensor::stack(&mask_rows, 0)?.to_dtype(DType::F32)?;

        let hidden = self.model.forward(&token_ids)?;

        // Mean over real tokens only. Every row has at least the special
        // tokens, so the count never divides by zero.
        let mask = mask.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;

        // Unit-length rows: cosine downstream reduces to a dot product
        let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let unit = pooled.broadcast_div(&norms)?;

        Ok(unit.to_vec2::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_metadata() {
        let provider = LocalProvider::new();
        assert_eq!(provider.kind(), ProviderKind::Local);
        assert_eq!(provider.dim(), 768);
        assert_eq!(provider.model_id(), MODEL_ID);
        assert!(!provider.is_loaded());
    }

    #[test]
    fn test_empty_input_needs_no_model() {
        let provider = LocalProvider::new();
        let result = provider.encode_sync(&[]);
        assert!(result.is_ok());
        assert!(result.unwrap().is_empty());
        assert!(!provider.is_loaded(), "empty input must not trigger a load");
    }

    #[test]
    fn test_clones_share_encoder_state() {
        let provider = LocalProvider::new();
        let clone = provider.clone();
        assert!(Arc::ptr_eq(&provider.inner, &clone.inner));
    }

    #[tokio::test]
    async fn test_check_status_reports_device() {
        let provider = LocalProvider::with_device(Device::Cpu);
        let status = provider.check_status().await.unwrap();
        assert_eq!(status.kind, ProviderKind::Local);
        assert_eq!(status.device, "CPU");
        assert!(!status.model_ready);
    }

    #[tokio::test]
    #[ignore] // Requires model download
    async fn test_encoding_async() {
        let provider = LocalProvider::new();
        let texts = vec!["male parent".to_string(), "female parent".to_string()];
        let embeddings = provider.encode(texts).await.unwrap();

        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), EMBEDDING_DIM);
        // Rows come back unit-normalized
        let norm: f32 = embeddings[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    #[ignore] // Requires model download
    async fn test_warmup() {
        let provider = LocalProvider::new();
        provider.warmup().await.unwrap();
        assert!(provider.is_loaded());
    }
}
