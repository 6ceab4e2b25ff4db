//! Embedding providers and the prefix/cache layer on top of them.

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{AppError, Result};
use crate::metrics::EMBEDDING_REQUEST_DURATION_SECONDS;
use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce one embedding vector per supplied text.
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

/// Deterministic in-process embedding client.
///
/// Hashes bytes into vector slots and L2-normalizes. No semantic quality,
/// but stable across runs, which is what local deployments and tests need.
pub struct LocalEmbeddingClient {
    dimension: usize,
}

impl LocalEmbeddingClient {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % self.dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.dimension == 0 {
            return Err(AppError::Embedding(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        let timer = Instant::now();
        let embeddings = texts.iter().map(|t| self.encode(t)).collect();
        EMBEDDING_REQUEST_DURATION_SECONDS
            .with_label_values(&["local"])
            .observe(timer.elapsed().as_secs_f64());

        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for a remote embedding model server.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let timer = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                texts,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: EmbedResponse = response.json().await?;

        EMBEDDING_REQUEST_DURATION_SECONDS
            .with_label_values(&["http"])
            .observe(timer.elapsed().as_secs_f64());

        if body.embeddings.len() != texts.len() {
            return Err(AppError::Embedding(format!(
                "Model server returned {} embeddings for {} texts",
                body.embeddings.len(),
                texts.len()
            )));
        }
        if let Some(first) = body.embeddings.first() {
            if first.len() != self.dimension {
                return Err(AppError::Embedding(format!(
                    "Model server returned dimension {} (expected {})",
                    first.len(),
                    self.dimension
                )));
            }
        }

        Ok(body.embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Build an embedding client for the configured provider.
pub fn create_embedding_client(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider {
        EmbeddingProvider::Local => Ok(Arc::new(LocalEmbeddingClient::new(config.dimension))),
        EmbeddingProvider::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                AppError::Configuration(
                    "embedding.endpoint is required for the http provider".to_string(),
                )
            })?;
            Ok(Arc::new(HttpEmbeddingClient::new(
                endpoint,
                &config.model,
                config.dimension,
            )))
        }
    }
}

/// Prefix-aware embedding layer with a title cache.
///
/// Titles repeat across every chunk of a document and often across whole
/// connector runs, so their vectors are cached.
pub struct Embedder {
    client: Arc<dyn EmbeddingClient>,
    batch_size: usize,
    query_prefix: String,
    passage_prefix: String,
    title_cache: Cache<String, Vec<f32>>,
}

impl Embedder {
    pub fn new(client: Arc<dyn EmbeddingClient>, config: &EmbeddingConfig) -> Self {
        Self {
            client,
            batch_size: config.batch_size.max(1),
            query_prefix: config.query_prefix.clone(),
            passage_prefix: config.passage_prefix.clone(),
            title_cache: Cache::new(10_000),
        }
    }

    pub fn dimension(&self) -> usize {
        self.client.dimension()
    }

    /// Embed passage-side texts, batched to the provider's batch size.
    pub async fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let prefixed: Vec<String> = texts
            .iter()
            .map(|t| format!("{}{}", self.passage_prefix, t))
            .collect();

        let mut embeddings = Vec::with_capacity(prefixed.len());
        for batch in prefixed.chunks(self.batch_size) {
            embeddings.extend(self.client.generate_embeddings(batch).await?);
        }
        Ok(embeddings)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let prefixed = format!("{}{}", self.query_prefix, text);
        let mut embeddings = self.client.generate_embeddings(&[prefixed]).await?;
        embeddings
            .pop()
            .ok_or_else(|| AppError::Embedding("Provider returned no embedding".to_string()))
    }

    /// Embed a title through the cache. Empty titles embed to nothing.
    pub async fn embed_title(&self, title: &str) -> Result<Option<Vec<f32>>> {
        if title.trim().is_empty() {
            return Ok(None);
        }
        if let Some(cached) = self.title_cache.get(title) {
            return Ok(Some(cached));
        }

        let embedding = self
            .embed_passages(&[title.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AppError::Embedding("Provider returned no embedding".to_string()))?;
        self.title_cache.insert(title.to_string(), embedding.clone());
        Ok(Some(embedding))
    }

    /// Issue a throwaway request so the first real batch does not pay
    /// provider warmup cost.
    pub async fn warm_up(&self) -> Result<()> {
        debug!("Warming up embedding provider");
        let _ = self
            .client
            .generate_embeddings(&["warmup".to_string()])
            .await?;
        Ok(())
    }
}
