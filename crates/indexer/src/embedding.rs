//! Embedding service client. The vector dimension is a property of the
//! configured model, discovered by probing at startup, never hard-coded.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use driftnet_core::CrawlError;

#[async_trait]
pub trait EmbeddingClient: Send + Sync + 'static {
    /// Vector dimension of the configured model.
    async fn dimension(&self) -> Result<usize, CrawlError>;

    /// One vector per input text, in order. A response with fewer vectors
    /// than inputs fails the whole batch as retryable.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CrawlError>;

    fn max_batch(&self) -> usize;
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

/// HTTP JSON contract: `POST {endpoint}/embed` with `{model, texts}` returns
/// `{embeddings: [[f32]]}`.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_batch: usize,
}

impl HttpEmbeddingClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_batch: max_batch.max(1),
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn dimension(&self) -> Result<usize, CrawlError> {
        let probe = vec!["dimension probe".to_string()];
        let vectors = self.embed(&probe).await?;
        vectors
            .first()
            .map(|v| v.len())
            .filter(|d| *d > 0)
            .ok_or_else(|| CrawlError::Embedding("dimension probe returned no vector".into()))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CrawlError> {
        let resp = self
            .client
            .post(format!("{}/embed", self.endpoint))
            .json(&EmbedRequest {
                model: &self.model,
                texts,
            })
            .send()
            .await
            .map_err(|e| CrawlError::Embedding(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_seconds = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(CrawlError::RateLimited {
                retry_after_seconds,
            });
        }
        if status.is_client_error() {
            // Invalid input is permanent; retrying the same batch cannot help.
            return Err(CrawlError::Parse(format!(
                "embedding service rejected input: HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(CrawlError::Embedding(format!(
                "HTTP {}",
                status.as_u16()
            )));
        }

        let body: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| CrawlError::Embedding(e.to_string()))?;
        if body.embeddings.len() != texts.len() {
            return Err(CrawlError::Embedding(format!(
                "returned {} vectors for {} texts",
                body.embeddings.len(),
                texts.len()
            )));
        }
        Ok(body.embeddings)
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }
}

/// Deterministic fixed-dimension embedder for tests and offline runs.
pub struct FixedEmbeddingClient {
    dim: usize,
}

impl FixedEmbeddingClient {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl EmbeddingClient for FixedEmbeddingClient {
    async fn dimension(&self) -> Result<usize, CrawlError> {
        Ok(self.dim)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CrawlError> {
        Ok(texts
            .iter()
            .map(|t| {
                let seed: u32 = t.bytes().map(u32::from).sum();
                (0..self.dim)
                    .map(|i| ((seed + i as u32) % 97) as f32 / 97.0)
                    .collect()
            })
            .collect())
    }

    fn max_batch(&self) -> usize {
        16
    }
}
