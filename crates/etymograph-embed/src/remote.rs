//! OpenAI-compatible remote embedding provider
//!
//! Talks to any `/v1/embeddings` endpoint (OpenAI, Azure OpenAI, Ollama,
//! vLLM). Transient failures retry with exponential backoff; auth and
//! unknown-model errors fail fast.
//!
//! # Endpoint Format
//!
//! - POST `{base_url}/embeddings`
//! - Request: `{"model": "...", "input": ["text1", "text2", ...]}`
//! - Response: `{"data": [{"embedding": [...], "index": 0}, ...], ...}`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, ProviderKind, ProviderStatus};

/// Default timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default max retries
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Configuration for the remote provider
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL for the API (e.g., "https://api.openai.com/v1")
    pub base_url: String,
    /// API key (optional for local endpoints like Ollama)
    pub api_key: Option<String>,
    /// Embedding model name
    pub model: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
}

impl RemoteConfig {
    /// Create config for OpenAI API
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: Some(api_key.into()),
            model: "text-embedding-3-small".into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create config for an Ollama local endpoint
    pub fn ollama() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
            model: "nomic-embed-text".into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Request body for the /embeddings endpoint
#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: Vec<String>,
}

/// Single embedding in the response
#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[allow(dead_code)]
    index: usize,
}

/// Response from the /embeddings endpoint
#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

/// OpenAI-compatible embedding provider
pub struct RemoteProvider {
    client: Client,
    config: RemoteConfig,
    /// Embedding dimension, detected from the first response
    dimension: AtomicUsize,
}

impl RemoteProvider {
    /// Create a new remote provider
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbedError::ProviderUnavailable(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            config,
            dimension: AtomicUsize::new(0),
        })
    }

    /// Get the embeddings endpoint URL
    fn embeddings_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/embeddings", base)
        } else {
            format!("{}/v1/embeddings", base)
        }
    }

    /// Send request with retry logic
    async fn request_with_retry(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut retry_delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_request(texts.clone()).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    warn!(
                        "remote embedding attempt {}/{} failed: {}; retrying in {:?}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        e,
                        retry_delay
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay *= 2;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| EmbedError::ProviderUnavailable("request failed after retries".into())))
    }

    /// Send a single request to the endpoint
    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let request_body = EmbeddingsRequest {
            model: self.config.model.clone(),
            input: texts,
        };

        let mut request = self.client.post(self.embeddings_url()).json(&request_body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbedError::RemoteTransport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(EmbedError::RemoteAuth(format!(
                    "endpoint rejected credentials ({})",
                    response.status()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                return Err(EmbedError::RemoteRateLimit { retry_after });
            }
            status if status.is_server_error() => {
                return Err(EmbedError::RemoteTransport(format!(
                    "server error: {}",
                    status
                )));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbedError::Embedding(format!(
                    "unexpected status {}: {}",
                    status, body
                )));
            }
        }

        let mut parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::RemoteTransport(format!("bad response body: {}", e)))?;

        if parsed.data.len() != expected {
            return Err(EmbedError::DimensionMismatch {
                expected,
                actual: parsed.data.len(),
            });
        }

        // The API documents index-annotated rows; keep input order explicit.
        parsed.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        if let Some(first) = vectors.first() {
            self.dimension.store(first.len(), Ordering::Relaxed);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    async fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        debug!("encoding {} texts via {}", texts.len(), self.config.model);
        self.request_with_retry(texts).await
    }

    async fn check_status(&self) -> Result<ProviderStatus> {
        let start = Instant::now();
        match self.send_request(vec!["ping".to_string()]).await {
            Ok(_) => Ok(ProviderStatus::healthy(ProviderKind::Remote, "Remote")
                .with_latency(start.elapsed().as_millis() as u64)),
            Err(e) => Ok(ProviderStatus::unavailable(
                ProviderKind::Remote,
                e.to_string(),
            )),
        }
    }

    async fn warmup(&self) -> Result<()> {
        let status = self.check_status().await?;
        if !status.available {
            return Err(EmbedError::ProviderUnavailable(
                status.error.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    fn dim(&self) -> usize {
        let detected = self.dimension.load(Ordering::Relaxed);
        if detected == 0 {
            crate::local::EMBEDDING_DIM
        } else {
            detected
        }
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embeddings_url_handles_v1_suffix() {
        let provider = RemoteProvider::new(RemoteConfig::ollama()).unwrap();
        assert_eq!(
            provider.embeddings_url(),
            "http://localhost:11434/v1/embeddings"
        );

        let mut config = RemoteConfig::ollama();
        config.base_url = "http://localhost:11434".into();
        let provider = RemoteProvider::new(config).unwrap();
        assert_eq!(
            provider.embeddings_url(),
            "http://localhost:11434/v1/embeddings"
        );
    }

    #[test]
    fn test_config_builders() {
        let config = RemoteConfig::openai("sk-test")
            .with_timeout(5)
            .with_max_retries(1);
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.model, "text-embedding-3-small");
    }

    #[test]
    fn test_dim_before_first_response() {
        let provider = RemoteProvider::new(RemoteConfig::ollama()).unwrap();
        assert_eq!(provider.dim(), 768);
    }
}
