//! Text embedding backend and vector utilities.
//!
//! Defines the [`TextEmbedder`] trait and [`OllamaEmbedder`], which calls an
//! Ollama instance's `POST /api/embeddings` endpoint with `{model, prompt}`
//! and reads back `{embedding}`. Each call is exactly one backend round trip
//! unless `embedding.max_retries` is raised.
//!
//! Also provides the vector helpers used by the stores:
//! - [`cosine_similarity`] / [`cosine_distance`]
//! - [`vec_to_blob`] / [`blob_to_vec`] for little-endian `f32` BLOB storage
//!
//! # Retry Strategy
//!
//! When retries are enabled:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RagError, Result};

/// Converts text into a vector in the text-embedding space.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed one text. Fails with [`RagError::EmptyInput`] on blank text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// Embedder backed by a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embedding.timeout_secs))
            .build()
            .map_err(|e| RagError::backend(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config
                .embedding
                .base_url(&config.ollama)
                .trim_end_matches('/')
                .to_string(),
            model: config.embedding.model.clone(),
            dims: config.embedding.dims,
            max_retries: config.embedding.max_retries,
        })
    }
}

#[async_trait]
impl TextEmbedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::EmptyInput);
        }

        let body = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let endpoint = format!("{}/api/embeddings", self.url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let response = match self.client.post(&endpoint).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(RagError::backend(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    )));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                    RagError::backend(format!("invalid embedding response: {}", e))
                })?;
                return check_embedding(parsed.embedding);
            }

            let body_text = response.text().await.unwrap_or_default();
            let err = RagError::backend(format!("Ollama API error {}: {}", status, body_text));
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(%status, "embedding backend returned a retryable error");
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| RagError::backend("embedding failed after retries")))
    }
}

fn check_embedding(embedding: Vec<f32>) -> Result<Vec<f32>> {
    if embedding.is_empty() {
        return Err(RagError::backend("embedding backend returned an empty vector"));
    }
    Ok(embedding)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// ```rust
/// use docchat::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero-magnitude vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance, `1 - cosine_similarity`. Smaller is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        let mut config = Config::default();
        // Nothing listens on the discard port.
        config.embedding.url = Some("http://127.0.0.1:9".to_string());
        config.embedding.timeout_secs = 2;
        config
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_empty_embedding_rejected() {
        assert!(matches!(check_embedding(vec![]), Err(RagError::Backend(_))));
        assert_eq!(check_embedding(vec![0.5]).unwrap(), vec![0.5]);
    }

    #[test]
    fn test_response_parsing() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"embedding":[0.1,0.2]}"#).unwrap();
        assert_eq!(parsed.embedding.len(), 2);
        let missing: EmbeddingResponse = serde_json::from_str("{}").unwrap();
        assert!(missing.embedding.is_empty());
    }

    #[tokio::test]
    async fn test_blank_text_is_empty_input() {
        let embedder = OllamaEmbedder::new(&offline_config()).unwrap();
        assert!(matches!(embedder.embed("   \n").await, Err(RagError::EmptyInput)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_backend_error() {
        let embedder = OllamaEmbedder::new(&offline_config()).unwrap();
        assert!(matches!(embedder.embed("hello").await, Err(RagError::Backend(_))));
    }
}
