use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/docchat.sqlite")
}

/// Generation backend settings.
#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    /// Generation model. Empty means pick the best installed model.
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: String::new(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Embedding backend URL. Falls back to `ollama.url` when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_text_dims")]
    pub dims: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            url: None,
            dims: default_text_dims(),
            timeout_secs: default_embedding_timeout_secs(),
            max_retries: 0,
        }
    }
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_text_dims() -> usize {
    768
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between neighbouring chunks, as a percentage of words.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub hybrid: bool,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            hybrid: false,
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_tokens() -> usize {
    2000
}

/// Image extraction and captioning settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_image_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_caption_script")]
    pub script: PathBuf,
    #[serde(default = "default_image_dims")]
    pub dims: usize,
    #[serde(default = "default_caption_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_image_dir(),
            python: default_python(),
            script: default_caption_script(),
            dims: default_image_dims(),
            timeout_secs: default_caption_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("./data/images")
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_caption_script() -> PathBuf {
    PathBuf::from("scripts/caption_image.py")
}
fn default_image_dims() -> usize {
    512
}
fn default_caption_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Scanned by `docchat ingest` when no paths are given.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
        }
    }
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("./documents")
}

impl EmbeddingConfig {
    /// Resolved backend URL for embedding calls.
    pub fn base_url<'a>(&'a self, ollama: &'a OllamaConfig) -> &'a str {
        self.url.as_deref().unwrap_or(&ollama.url)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Like [`load_config`], but falls back to built-in defaults when `path` does not exist.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap > 100 {
        anyhow::bail!("chunking.chunk_overlap is a percentage and must be <= 100");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_tokens < 1 {
        anyhow::bail!("retrieval.max_context_tokens must be >= 1");
    }

    // Validate vector spaces
    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.images.dims == 0 {
        anyhow::bail!("images.dims must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.max_context_tokens, 2000);
        assert_eq!(config.embedding.model, "nomic-embed-text");
        assert_eq!(config.embedding.dims, 768);
        assert_eq!(config.images.dims, 512);
        assert_eq!(config.embedding.base_url(&config.ollama), "http://localhost:11434");
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 256

            [embedding]
            url = "http://embed:11434"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.chunk_size, 256);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.embedding.base_url(&config.ollama), "http://embed:11434");
    }

    #[test]
    fn test_rejects_overlap_over_100() {
        let config: Config = toml::from_str("[chunking]\nchunk_overlap = 150\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let config: Config = toml::from_str("[retrieval]\ntop_k = 0\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = load_config_or_default(Path::new("/nonexistent/docchat.toml")).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
    }
}
