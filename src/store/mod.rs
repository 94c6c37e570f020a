//! Storage abstraction for docchat.
//!
//! The [`DocumentStore`] trait defines every persistence operation the
//! pipeline needs, enabling pluggable backends:
//!
//! - [`sqlite::SqliteStore`]: the production store over an `sqlx` pool.
//! - [`memory::InMemoryStore`]: for tests and embedding in other tools.
//!
//! Chunks and images live in separate vector spaces with different
//! dimensionality. [`VectorIndex`] exposes each space as an independent
//! named index ([`TextIndex`], [`ImageIndex`]) over the same store.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::{RagError, Result};
use crate::models::{
    Chunk, Conversation, Document, Image, NewDocument, ProcessedStats, Scored, StoreStats,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_by_hash`](DocumentStore::find_by_hash) | Incremental-ingestion lookup |
/// | [`create_document`](DocumentStore::create_document) | Register a newly seen file |
/// | [`mark_processed`](DocumentStore::mark_processed) | Set `processed_at`, clear error |
/// | [`record_error`](DocumentStore::record_error) | Record a failure on the row |
/// | [`insert_chunks`](DocumentStore::insert_chunks) | Atomic chunk batch |
/// | [`insert_images`](DocumentStore::insert_images) | Atomic image batch |
/// | [`search_chunks`](DocumentStore::search_chunks) | Nearest chunks by cosine distance |
/// | [`search_images`](DocumentStore::search_images) | Nearest images by cosine distance |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Document>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// All documents, newest first.
    async fn list_documents(&self) -> Result<Vec<Document>>;

    async fn create_document(&self, doc: &NewDocument) -> Result<Document>;

    async fn mark_processed(&self, id: &str, stats: ProcessedStats) -> Result<()>;

    async fn record_error(&self, id: &str, message: &str) -> Result<()>;

    /// Delete a document with its chunks and images. Returns false if absent.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Insert all chunks or none.
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Insert all images or none.
    async fn insert_images(&self, images: &[Image]) -> Result<()>;

    /// Chunks of one document in `chunk_index` order.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Images of one document in `image_index` order.
    async fn images_for_document(&self, document_id: &str) -> Result<Vec<Image>>;

    /// Images still lacking an embedding, across all documents.
    async fn pending_images(&self) -> Result<Vec<Image>>;

    async fn update_image(&self, id: &str, caption: &str, embedding: &[f32]) -> Result<()>;

    /// Clear caption and embedding on every image. Returns rows touched.
    async fn reset_image_embeddings(&self) -> Result<u64>;

    /// Up to `limit` chunks ranked by ascending cosine distance to `query`.
    ///
    /// Fails with [`RagError::DimensionMismatch`] when stored vectors have a
    /// different dimension than `query`.
    async fn search_chunks(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Chunk>>>;

    /// Image-space counterpart of [`search_chunks`](DocumentStore::search_chunks).
    async fn search_images(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Image>>>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Rank `(item, vector)` pairs by cosine distance to `query`.
///
/// The sort is stable, so equal distances keep storage order.
pub(crate) fn rank_by_distance<T>(
    candidates: Vec<(T, Vec<f32>)>,
    query: &[f32],
    limit: usize,
) -> Result<Vec<Scored<T>>> {
    if let Some((_, v)) = candidates.iter().find(|(_, v)| v.len() != query.len()) {
        return Err(RagError::DimensionMismatch {
            expected: v.len(),
            actual: query.len(),
        });
    }

    let mut scored: Vec<Scored<T>> = candidates
        .into_iter()
        .map(|(item, v)| Scored {
            distance: cosine_distance(query, &v),
            item,
        })
        .collect();
    scored.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    Ok(scored)
}

/// A searchable vector space.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    type Item: Send;

    /// Index name, for logs.
    fn name(&self) -> &'static str;

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<Scored<Self::Item>>>;
}

/// The chunk (text-embedding) space.
pub struct TextIndex {
    store: Arc<dyn DocumentStore>,
}

impl TextIndex {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VectorIndex for TextIndex {
    type Item = Chunk;

    fn name(&self) -> &'static str {
        "text"
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<Scored<Chunk>>> {
        self.store.search_chunks(query, k).await
    }
}

/// The image-embedding space.
pub struct ImageIndex {
    store: Arc<dyn DocumentStore>,
}

impl ImageIndex {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VectorIndex for ImageIndex {
    type Item = Image;

    fn name(&self) -> &'static str {
        "image"
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<Scored<Image>>> {
        self.store.search_images(query, k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_orders_by_distance() {
        let candidates = vec![
            ("far", vec![0.0, 1.0]),
            ("near", vec![1.0, 0.1]),
            ("exact", vec![1.0, 0.0]),
        ];
        let ranked = rank_by_distance(candidates, &[1.0, 0.0], 2).unwrap();
        let names: Vec<_> = ranked.iter().map(|s| s.item).collect();
        assert_eq!(names, vec!["exact", "near"]);
        assert!(ranked[0].distance <= ranked[1].distance);
    }

    #[test]
    fn test_rank_ties_keep_storage_order() {
        let candidates = vec![("first", vec![1.0, 0.0]), ("second", vec![2.0, 0.0])];
        let ranked = rank_by_distance(candidates, &[1.0, 0.0], 5).unwrap();
        assert_eq!(ranked[0].item, "first");
        assert_eq!(ranked[1].item, "second");
    }

    #[test]
    fn test_rank_dimension_mismatch() {
        let candidates = vec![("img", vec![0.5; 512])];
        let err = rank_by_distance(candidates, &[0.1; 768], 5).unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 512,
                actual: 768
            }
        ));
    }

    #[test]
    fn test_rank_empty_index() {
        let ranked = rank_by_distance::<&str>(vec![], &[1.0], 5).unwrap();
        assert!(ranked.is_empty());
    }
}
