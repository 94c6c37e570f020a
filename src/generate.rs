//! Generation backend client.
//!
//! [`OllamaClient`] talks to an Ollama instance:
//!
//! | Endpoint | Use |
//! |----------|-----|
//! | `POST /api/generate` | completion, streamed or whole |
//! | `GET /api/tags` | installed models |
//!
//! Responses are newline-delimited JSON frames `{response, done, error?}`.
//! Network chunks do not respect frame boundaries, so [`FrameDecoder`]
//! buffers partial lines between reads. No retries happen at this layer.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{RagError, Result};
use crate::stats::format_bytes;

/// Model preference, best first. Matched as a substring of the lowercased name.
const PREFERRED_MODELS: &[&str] = &["llama3.2", "llama3.1", "qwen2.5", "mistral", "llama3", "llama2"];

/// Produces text for a prompt.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate the whole answer in one response.
    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;

    /// Generate incrementally, calling `on_token` for every non-empty piece.
    /// Returns the concatenated answer.
    async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One NDJSON frame from `/api/generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateFrame {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// An installed model, as listed by `/api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Splits a byte stream into NDJSON frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<GenerateFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(frame) = parse_frame(&line)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flush a trailing frame that had no newline.
    pub fn finish(&mut self) -> Result<Option<GenerateFrame>> {
        let rest = std::mem::take(&mut self.buf);
        parse_frame(&rest)
    }
}

fn parse_frame(line: &[u8]) -> Result<Option<GenerateFrame>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let frame: GenerateFrame = serde_json::from_str(text)
        .map_err(|e| RagError::backend(format!("malformed generation frame: {}", e)))?;
    if let Some(err) = frame.error.as_deref().filter(|e| !e.is_empty()) {
        return Err(RagError::backend(format!("generation failed: {}", err)));
    }
    Ok(Some(frame))
}

/// Client for a local Ollama instance.
pub struct OllamaClient {
    client: reqwest::Client,
    url: String,
}

impl OllamaClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.ollama.timeout_secs))
            .build()
            .map_err(|e| RagError::backend(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.ollama.url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_generate(&self, model: &str, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = GenerateRequest {
            model,
            prompt,
            stream,
        };
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                RagError::backend(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::backend(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }
        Ok(response)
    }

    /// Models installed on the backend.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.url))
            .send()
            .await
            .map_err(|e| {
                RagError::backend(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::backend(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| RagError::backend(format!("invalid model list: {}", e)))?;
        Ok(tags.models)
    }

    /// The configured model, or the best installed one when none is configured.
    pub async fn resolve_model(&self, configured: &str) -> Result<String> {
        if !configured.trim().is_empty() {
            return Ok(configured.to_string());
        }
        let models = self.list_models().await?;
        let chosen = select_best_model(&models)
            .ok_or_else(|| RagError::backend("no models available"))?;
        info!(model = %chosen, "selected generation model");
        Ok(chosen)
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        let response = self.post_generate(model, prompt, false).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RagError::backend(format!("failed to read generation response: {}", e)))?;

        let mut decoder = FrameDecoder::new();
        let mut answer = String::new();
        let frames = decoder.push(&bytes)?;
        for frame in frames.into_iter().chain(decoder.finish()?) {
            answer.push_str(&frame.response);
            if frame.done {
                break;
            }
        }
        Ok(answer)
    }

    async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<String> {
        let response = self.post_generate(model, prompt, true).await?;
        let mut stream = response.bytes_stream();
        let mut decoder = FrameDecoder::new();
        let mut answer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| RagError::backend(format!("generation stream error: {}", e)))?;
            for frame in decoder.push(&bytes)? {
                if !frame.response.is_empty() {
                    on_token(&frame.response);
                    answer.push_str(&frame.response);
                }
                if frame.done {
                    debug!(chars = answer.len(), "generation finished");
                    return Ok(answer);
                }
            }
        }

        if let Some(frame) = decoder.finish()? {
            if !frame.response.is_empty() {
                on_token(&frame.response);
                answer.push_str(&frame.response);
            }
        }
        Ok(answer)
    }
}

/// Pick a generation model: the first preferred family present, otherwise
/// the largest installed model.
pub fn select_best_model(models: &[ModelInfo]) -> Option<String> {
    for preferred in PREFERRED_MODELS {
        if let Some(m) = models
            .iter()
            .find(|m| m.name.to_lowercase().contains(preferred))
        {
            return Some(m.name.clone());
        }
    }
    models
        .iter()
        .fold(None::<&ModelInfo>, |best, m| match best {
            Some(b) if b.size >= m.size => Some(b),
            _ => Some(m),
        })
        .map(|m| m.name.clone())
}

/// `docchat models`
pub async fn run_models(config: &Config) -> anyhow::Result<()> {
    let client = OllamaClient::new(config)?;
    let models = client.list_models().await?;

    if models.is_empty() {
        println!("No models installed.");
        return Ok(());
    }

    let selected = if config.ollama.model.trim().is_empty() {
        select_best_model(&models)
    } else {
        Some(config.ollama.model.clone())
    };

    println!("  {:<40} {:>10}   {}", "MODEL", "SIZE", "MODIFIED");
    println!("  {}", "-".repeat(72));
    for m in &models {
        let marker = if selected.as_deref() == Some(m.name.as_str()) {
            "*"
        } else {
            " "
        };
        let modified: String = m.modified_at.chars().take(10).collect();
        println!(
            "{} {:<40} {:>10}   {}",
            marker,
            m.name,
            format_bytes(m.size),
            modified
        );
    }
    if let Some(name) = selected {
        println!();
        println!("  selected: {}", name);
    }
    Ok(())
}
