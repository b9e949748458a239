//! Embedding client for the image/text inference service
//!
//! The service exposes a single `POST /embed` endpoint that accepts either
//! an image path or a text string and answers with one embedding vector.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use imgidx_core::{EmbeddingConfig, ImgIdxError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Embedding Trait
// ============================================================================

/// Request body of the inference RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EmbedRequest {
    /// `{"image_path": ...}`
    #[serde(rename = "image_path")]
    ImagePath(String),

    /// `{"string": ...}`
    #[serde(rename = "string")]
    Text(String),
}

/// Trait for embedding generation
///
/// One call is one attempt; implementations never retry on their own.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Resolve an embedding for the request
    async fn embed(&self, request: &EmbedRequest) -> Result<Vec<f32>>;

    /// Get embedding dimension
    fn dimension(&self) -> usize;

    /// Embed the image stored at `path`
    async fn embed_image(&self, path: &str) -> Result<Vec<f32>> {
        self.embed(&EmbedRequest::ImagePath(path.to_string())).await
    }

    /// Embed a free-text query
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&EmbedRequest::Text(text.to_string())).await
    }
}

// ============================================================================
// HTTP Embedding Client
// ============================================================================

/// Client for the `/embed` inference endpoint
pub struct HttpEmbeddingClient {
    client: Client,
    endpoint: String,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl HttpEmbeddingClient {
    /// Create a new client
    pub fn new(base_url: &str, dimension: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImgIdxError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embed", base_url.trim_end_matches('/')),
            dimension,
        })
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.dimension as usize,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Full URL requests are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, request: &EmbedRequest) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                ImgIdxError::EmbeddingUnavailable(format!("Embedding request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ImgIdxError::EmbeddingUnavailable(format!(
                "Embedding service returned {status}: {error_text}"
            )));
        }

        let result: EmbedResponse = response.json().await.map_err(|e| {
            ImgIdxError::EmbeddingUnavailable(format!("Failed to parse embedding response: {e}"))
        })?;

        let embedding = result.embedding.ok_or_else(|| {
            ImgIdxError::EmbeddingUnavailable("Response has no embedding field".to_string())
        })?;

        // A wrong-sized vector means the model and collection disagree
        if embedding.len() != self.dimension {
            return Err(ImgIdxError::SchemaMismatch(format!(
                "embedding has {} dims, expected {}",
                embedding.len(),
                self.dimension
            )));
        }

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Tests
// ============================================================================
