//! Image captioning and embedding.
//!
//! Two strategies implement [`ImageEmbedder`]:
//!
//! - [`SubprocessImageEmbedder`] runs an external script
//!   (`<python> <script> <image>`) that prints `{"caption": .., "embedding": [..]}`
//!   on stdout. Any failure of the script (missing, non-zero exit, timeout,
//!   malformed JSON, `error` field, empty or wrong-sized vector) falls back to
//!   the placeholder result for that image.
//! - [`PlaceholderImageEmbedder`] derives a caption from the file name and
//!   returns a fixed, non-informative vector.
//!
//! [`create_image_embedder`] probes the script once and picks a strategy.
//! Placeholder vectors carry no meaning; callers must not rely on their
//! ranking.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ImagesConfig;
use crate::error::{RagError, Result};

/// Caption and vector for one image.
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    pub caption: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Strategy name, for logs and `stats`.
    fn name(&self) -> &str;
    /// Dimensionality of the image-embedding space.
    fn dims(&self) -> usize;
    async fn process(&self, image_path: &Path) -> Result<ImageEmbedding>;
}

/// Deterministic stand-in used when no captioning backend is available.
pub struct PlaceholderImageEmbedder {
    dims: usize,
}

impl PlaceholderImageEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn placeholder(&self, image_path: &Path) -> ImageEmbedding {
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ImageEmbedding {
            caption: format!("Image: {}", file_name),
            embedding: (0..self.dims).map(|i| (i % 100) as f32 / 100.0).collect(),
        }
    }
}

#[async_trait]
impl ImageEmbedder for PlaceholderImageEmbedder {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn process(&self, image_path: &Path) -> Result<ImageEmbedding> {
        if !image_path.is_file() {
            return Err(RagError::io(
                image_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "image file not found"),
            ));
        }
        Ok(self.placeholder(image_path))
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ScriptOutput {
    #[serde(default)]
    caption: String,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs the captioning script once per image.
pub struct SubprocessImageEmbedder {
    python: String,
    script: PathBuf,
    timeout: Duration,
    fallback: PlaceholderImageEmbedder,
}

impl SubprocessImageEmbedder {
    pub fn new(config: &ImagesConfig) -> Self {
        Self {
            python: config.python.clone(),
            script: config.script.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            fallback: PlaceholderImageEmbedder::new(config.dims),
        }
    }

    async fn run_script(&self, image_path: &Path) -> std::result::Result<ImageEmbedding, String> {
        let mut command = tokio::process::Command::new(&self.python);
        command
            .arg(&self.script)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| format!("timed out after {:?}", self.timeout))?
            .map_err(|e| format!("cannot spawn {}: {}", self.python, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("exited with {}: {}", output.status, stderr.trim()));
        }

        parse_script_output(&output.stdout, self.fallback.dims)
    }
}

fn parse_script_output(
    stdout: &[u8],
    dims: usize,
) -> std::result::Result<ImageEmbedding, String> {
    let parsed: ScriptOutput =
        serde_json::from_slice(stdout).map_err(|e| format!("malformed output: {}", e))?;
    if let Some(err) = parsed.error.filter(|e| !e.is_empty()) {
        return Err(format!("script reported: {}", err));
    }
    if parsed.embedding.is_empty() {
        return Err("script returned an empty embedding".to_string());
    }
    if parsed.embedding.len() != dims {
        return Err(format!(
            "script returned {} dimensions, expected {}",
            parsed.embedding.len(),
            dims
        ));
    }
    Ok(ImageEmbedding {
        caption: parsed.caption,
        embedding: parsed.embedding,
    })
}

#[async_trait]
impl ImageEmbedder for SubprocessImageEmbedder {
    fn name(&self) -> &str {
        "subprocess"
    }

    fn dims(&self) -> usize {
        self.fallback.dims
    }

    async fn process(&self, image_path: &Path) -> Result<ImageEmbedding> {
        if !image_path.is_file() {
            return Err(RagError::io(
                image_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "image file not found"),
            ));
        }
        match self.run_script(image_path).await {
            Ok(result) => Ok(result),
            Err(reason) => {
                warn!(
                    image = %image_path.display(),
                    "captioning script failed, using placeholder: {}", reason
                );
                Ok(self.fallback.placeholder(image_path))
            }
        }
    }
}

/// Pick the captioning strategy by probing for the script and interpreter.
pub async fn create_image_embedder(config: &ImagesConfig) -> Arc<dyn ImageEmbedder> {
    if !config.script.is_file() {
        info!(
            script = %config.script.display(),
            "captioning script not found, images get placeholder captions"
        );
        return Arc::new(PlaceholderImageEmbedder::new(config.dims));
    }

    let mut command = tokio::process::Command::new(&config.python);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let probe = tokio::time::timeout(PROBE_TIMEOUT, command.status()).await;
    match probe {
        Ok(Ok(status)) if status.success() => {
            debug!(python = %config.python, "captioning backend available");
            Arc::new(SubprocessImageEmbedder::new(config))
        }
        _ => {
            info!(
                python = %config.python,
                "python interpreter unavailable, images get placeholder captions"
            );
            Arc::new(PlaceholderImageEmbedder::new(config.dims))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn images_config(script: PathBuf, python: &str) -> ImagesConfig {
        ImagesConfig {
            python: python.to_string(),
            script,
            dims: 4,
            timeout_secs: 10,
            ..ImagesConfig::default()
        }
    }

    #[tokio::test]
    async fn test_placeholder_caption_and_vector() {
        let tmp = TempDir::new().unwrap();
        let img = tmp.path().join("pdf_book_0.jpg");
        std::fs::write(&img, b"jpeg").unwrap();

        let result = PlaceholderImageEmbedder::new(512).process(&img).await.unwrap();
        assert_eq!(result.caption, "Image: pdf_book_0.jpg");
        assert_eq!(result.embedding.len(), 512);
        assert_eq!(result.embedding[0], 0.0);
        assert!((result.embedding[101] - 0.01).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_image_is_error() {
        let err = PlaceholderImageEmbedder::new(8)
            .process(Path::new("/no/such/image.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Io { .. }));
    }

    #[test]
    fn test_parse_script_output() {
        let ok = parse_script_output(br#"{"caption":"a cat","embedding":[1,2,3,4]}"#, 4).unwrap();
        assert_eq!(ok.caption, "a cat");
        assert!(parse_script_output(b"not json", 4).is_err());
        assert!(parse_script_output(br#"{"caption":"x","embedding":[]}"#, 4).is_err());
        assert!(parse_script_output(br#"{"caption":"x","embedding":[1]}"#, 4).is_err());
        assert!(parse_script_output(br#"{"error":"no model","embedding":[1,2,3,4]}"#, 4).is_err());
    }

    #[tokio::test]
    async fn test_missing_script_selects_placeholder() {
        let config = images_config(PathBuf::from("/no/such/script.py"), "python3");
        assert_eq!(create_image_embedder(&config).await.name(), "placeholder");
    }

    #[tokio::test]
    async fn test_interpreter_probe_picks_strategy() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("caption.py");
        std::fs::write(&script, "").unwrap();

        let usable = images_config(script.clone(), "true");
        assert_eq!(create_image_embedder(&usable).await.name(), "subprocess");

        let broken = images_config(script.clone(), "false");
        assert_eq!(create_image_embedder(&broken).await.name(), "placeholder");

        let absent = images_config(script, "/no/such/python");
        assert_eq!(create_image_embedder(&absent).await.name(), "placeholder");
    }

    #[tokio::test]
    async fn test_failing_interpreter_falls_back() {
        let tmp = TempDir::new().unwrap();
        let img = tmp.path().join("x.png");
        std::fs::write(&img, b"png").unwrap();
        let script = tmp.path().join("caption.py");
        std::fs::write(&script, "").unwrap();

        // `false` ignores its arguments and exits non-zero.
        let embedder = SubprocessImageEmbedder::new(&images_config(script, "false"));
        let result = embedder.process(&img).await.unwrap();
        assert_eq!(result.caption, "Image: x.png");
        assert_eq!(result.embedding.len(), 4);
    }
}
