//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Library code returns [`Result`]; the command layer wraps these in
//! `anyhow` with additional context.

use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// A file could not be opened or read.
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file extension is not one of the recognised document types.
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    /// The document parser rejected the file.
    #[error("failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    /// Embedding input was empty after trimming.
    #[error("cannot embed empty text")]
    EmptyInput,

    /// Embedding or generation backend was unreachable or answered garbage.
    #[error("backend error: {0}")]
    Backend(String),

    /// Query vector and stored vectors live in different spaces.
    #[error("vector dimension mismatch: index holds {expected}-d vectors, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("storage error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RagError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RagError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        RagError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        RagError::Backend(message.into())
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        RagError::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for RagError {
    fn from(e: tokio::task::JoinError) -> Self {
        RagError::Store(format!("background task failed: {}", e))
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagError::Cancelled),
        res = fut => res,
    }
}

/// Fail fast if `cancel` has already fired.
pub fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RagError::Cancelled)
    } else {
        Ok(())
    }
}

/// A token that cancels itself after `secs` seconds, when set.
pub fn deadline_token(secs: Option<u64>) -> CancellationToken {
    let token = CancellationToken::new();
    if let Some(secs) = secs {
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            child.cancel();
        });
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_cancel_passes_through() {
        let token = CancellationToken::new();
        let v = with_cancel(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_with_cancel_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let res: Result<()> = with_cancel(&token, std::future::pending()).await;
        assert!(matches!(res, Err(RagError::Cancelled)));
        assert!(check_cancel(&token).is_err());
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let e = RagError::DimensionMismatch {
            expected: 512,
            actual: 768,
        };
        assert!(e.to_string().contains("512"));
        assert!(e.to_string().contains("768"));
    }
}
