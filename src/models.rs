//! Core data models used throughout docchat.
//!
//! These types represent the documents, chunks, images, and conversations
//! that flow through the ingestion and retrieval pipeline.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::{RagError, Result};

/// Recognised document formats, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Epub,
}

impl FileType {
    /// Determine the type from the path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(FileType::Pdf),
            "epub" => Ok(FileType::Epub),
            "" => Err(RagError::UnsupportedType("(no extension)".to_string())),
            other => Err(RagError::UnsupportedType(format!(".{}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Epub => "epub",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(FileType::Pdf),
            "epub" => Some(FileType::Epub),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source document, identified by the SHA-256 of its bytes.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_type: FileType,
    pub file_hash: String,
    pub page_count: Option<i64>,
    pub word_count: Option<i64>,
    pub processed_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn status(&self) -> &'static str {
        if self.processed_at.is_some() {
            "processed"
        } else if self.error_message.is_some() {
            "failed"
        } else {
            "pending"
        }
    }
}

/// Fields needed to register a newly seen document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_path: String,
    pub file_name: String,
    pub file_type: FileType,
    pub file_hash: String,
}

/// Statistics recorded when a document finishes processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessedStats {
    pub page_count: i64,
    pub word_count: i64,
}

/// A word-bounded span of a document's text.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// An image extracted from a document, with optional caption and embedding.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub id: String,
    pub document_id: String,
    pub image_index: i64,
    pub file_path: String,
    pub caption: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// A search hit with its cosine distance to the query (smaller is closer).
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub distance: f32,
}

/// Ranked chunks and images for one query. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub chunks: Vec<Scored<Chunk>>,
    pub images: Vec<Scored<Image>>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.images.is_empty()
    }
}

/// One saved question/answer exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub model_name: String,
    pub context_chunk_ids: Vec<String>,
    pub context_image_ids: Vec<String>,
    pub created_at: i64,
}

/// Aggregate counts reported by `docchat stats`.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub documents: i64,
    pub processed_documents: i64,
    pub failed_documents: i64,
    pub chunks: i64,
    pub images: i64,
    pub embedded_images: i64,
    pub pages: i64,
    pub words: i64,
    pub documents_with_images: i64,
    pub conversations: i64,
    pub by_type: Vec<TypeStats>,
}

#[derive(Debug, Clone)]
pub struct TypeStats {
    pub file_type: String,
    pub documents: i64,
    pub chunks: i64,
    pub images: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(FileType::from_path(Path::new("a/b.pdf")).unwrap(), FileType::Pdf);
        assert_eq!(FileType::from_path(Path::new("BOOK.EPUB")).unwrap(), FileType::Epub);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = FileType::from_path(Path::new("notes.txt")).unwrap_err();
        assert!(matches!(err, RagError::UnsupportedType(ref e) if e == ".txt"));
        assert!(FileType::from_path(Path::new("README")).is_err());
    }
}
