//! In-memory [`DocumentStore`] implementation for tests and embedding.
//!
//! Uses `Vec`s behind one `std::sync::RwLock`, so batch inserts are atomic
//! by construction. Vector search is brute-force cosine distance over the
//! stored vectors, in insertion order.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{
    Chunk, Conversation, Document, Image, NewDocument, ProcessedStats, Scored, StoreStats,
    TypeStats,
};

use super::{rank_by_distance, DocumentStore};

#[derive(Default)]
struct Tables {
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    images: Vec<Image>,
    conversations: Vec<Conversation>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| RagError::Store("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| RagError::Store("in-memory store lock poisoned".to_string()))
    }

    /// Saved conversations, oldest first.
    pub fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.read()?.conversations.clone())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Document>> {
        Ok(self
            .read()?
            .documents
            .iter()
            .find(|d| d.file_hash == file_hash)
            .cloned())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let mut docs = self.read()?.documents.clone();
        docs.reverse();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn create_document(&self, doc: &NewDocument) -> Result<Document> {
        let mut tables = self.write()?;
        if tables.documents.iter().any(|d| d.file_hash == doc.file_hash) {
            return Err(RagError::Store(format!(
                "a document with hash {} already exists",
                doc.file_hash
            )));
        }
        let ts = now();
        let created = Document {
            id: Uuid::new_v4().to_string(),
            file_path: doc.file_path.clone(),
            file_name: doc.file_name.clone(),
            file_type: doc.file_type,
            file_hash: doc.file_hash.clone(),
            page_count: None,
            word_count: None,
            processed_at: None,
            error_message: None,
            created_at: ts,
            updated_at: ts,
        };
        tables.documents.push(created.clone());
        Ok(created)
    }

    async fn mark_processed(&self, id: &str, stats: ProcessedStats) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(doc) = tables.documents.iter_mut().find(|d| d.id == id) {
            let ts = now();
            doc.processed_at = Some(ts);
            doc.updated_at = ts;
            doc.error_message = None;
            doc.page_count = Some(stats.page_count);
            doc.word_count = Some(stats.word_count);
        }
        Ok(())
    }

    async fn record_error(&self, id: &str, message: &str) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(doc) = tables.documents.iter_mut().find(|d| d.id == id) {
            doc.error_message = Some(message.to_string());
            doc.updated_at = now();
        }
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tables = self.write()?;
        let before = tables.documents.len();
        tables.documents.retain(|d| d.id != id);
        if tables.documents.len() == before {
            return Ok(false);
        }
        tables.chunks.retain(|c| c.document_id != id);
        tables.images.retain(|i| i.document_id != id);
        Ok(true)
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tables = self.write()?;
        let mut batch_keys = HashSet::new();
        for chunk in chunks {
            if !tables.documents.iter().any(|d| d.id == chunk.document_id) {
                return Err(RagError::Store(format!(
                    "chunk references unknown document {}",
                    chunk.document_id
                )));
            }
            let taken = tables
                .chunks
                .iter()
                .any(|c| c.document_id == chunk.document_id && c.chunk_index == chunk.chunk_index);
            if taken || !batch_keys.insert((chunk.document_id.as_str(), chunk.chunk_index)) {
                return Err(RagError::Store(format!(
                    "duplicate chunk index {} for document {}",
                    chunk.chunk_index, chunk.document_id
                )));
            }
        }
        tables.chunks.extend_from_slice(chunks);
        Ok(())
    }

    async fn insert_images(&self, images: &[Image]) -> Result<()> {
        let mut tables = self.write()?;
        for image in images {
            if !tables.documents.iter().any(|d| d.id == image.document_id) {
                return Err(RagError::Store(format!(
                    "image references unknown document {}",
                    image.document_id
                )));
            }
        }
        tables.images.extend_from_slice(images);
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .read()?
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn images_for_document(&self, document_id: &str) -> Result<Vec<Image>> {
        let mut images: Vec<Image> = self
            .read()?
            .images
            .iter()
            .filter(|i| i.document_id == document_id)
            .cloned()
            .collect();
        images.sort_by_key(|i| i.image_index);
        Ok(images)
    }

    async fn pending_images(&self) -> Result<Vec<Image>> {
        Ok(self
            .read()?
            .images
            .iter()
            .filter(|i| i.embedding.is_none())
            .cloned()
            .collect())
    }

    async fn update_image(&self, id: &str, caption: &str, embedding: &[f32]) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(image) = tables.images.iter_mut().find(|i| i.id == id) {
            image.caption = Some(caption.to_string());
            image.embedding = Some(embedding.to_vec());
        }
        Ok(())
    }

    async fn reset_image_embeddings(&self) -> Result<u64> {
        let mut tables = self.write()?;
        let mut touched = 0u64;
        for image in tables.images.iter_mut() {
            if image.caption.is_some() || image.embedding.is_some() {
                image.caption = None;
                image.embedding = None;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn search_chunks(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Chunk>>> {
        let candidates: Vec<(Chunk, Vec<f32>)> = self
            .read()?
            .chunks
            .iter()
            .filter_map(|c| c.embedding.clone().map(|v| (c.clone(), v)))
            .collect();
        rank_by_distance(candidates, query, limit)
    }

    async fn search_images(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Image>>> {
        let candidates: Vec<(Image, Vec<f32>)> = self
            .read()?
            .images
            .iter()
            .filter_map(|i| i.embedding.clone().map(|v| (i.clone(), v)))
            .collect();
        rank_by_distance(candidates, query, limit)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write()?.conversations.push(conversation.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let tables = self.read()?;
        let mut stats = StoreStats {
            documents: tables.documents.len() as i64,
            chunks: tables.chunks.len() as i64,
            images: tables.images.len() as i64,
            conversations: tables.conversations.len() as i64,
            ..StoreStats::default()
        };
        for doc in &tables.documents {
            if doc.is_processed() {
                stats.processed_documents += 1;
            } else if doc.error_message.is_some() {
                stats.failed_documents += 1;
            }
            stats.pages += doc.page_count.unwrap_or(0);
            stats.words += doc.word_count.unwrap_or(0);
            if tables.images.iter().any(|i| i.document_id == doc.id) {
                stats.documents_with_images += 1;
            }
        }
        stats.embedded_images = tables.images.iter().filter(|i| i.embedding.is_some()).count() as i64;

        for file_type in ["epub", "pdf"] {
            let ids: Vec<&str> = tables
                .documents
                .iter()
                .filter(|d| d.file_type.as_str() == file_type)
                .map(|d| d.id.as_str())
                .collect();
            if ids.is_empty() {
                continue;
            }
            stats.by_type.push(TypeStats {
                file_type: file_type.to_string(),
                documents: ids.len() as i64,
                chunks: tables
                    .chunks
                    .iter()
                    .filter(|c| ids.contains(&c.document_id.as_str()))
                    .count() as i64,
                images: tables
                    .images
                    .iter()
                    .filter(|i| ids.contains(&i.document_id.as_str()))
                    .count() as i64,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileType;

    fn new_doc(hash: &str) -> NewDocument {
        NewDocument {
            file_path: format!("/docs/{}.pdf", hash),
            file_name: format!("{}.pdf", hash),
            file_type: FileType::Pdf,
            file_hash: hash.to_string(),
        }
    }

    fn chunk(doc: &str, index: i64, v: Vec<f32>) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            content: format!("chunk {}", index),
            embedding: Some(v),
        }
    }

    #[tokio::test]
    async fn test_hash_lookup_and_uniqueness() {
        let store = InMemoryStore::new();
        let doc = store.create_document(&new_doc("abc")).await.unwrap();
        let found = store.find_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(found.id, doc.id);
        assert!(store.create_document(&new_doc("abc")).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_chunk_batch_rejected_whole() {
        let store = InMemoryStore::new();
        let doc = store.create_document(&new_doc("abc")).await.unwrap();
        let batch = vec![
            chunk(&doc.id, 0, vec![1.0]),
            chunk(&doc.id, 1, vec![1.0]),
            chunk(&doc.id, 1, vec![1.0]),
        ];
        assert!(store.insert_chunks(&batch).await.is_err());
        assert!(store.chunks_for_document(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = InMemoryStore::new();
        let doc = store.create_document(&new_doc("abc")).await.unwrap();
        store
            .insert_chunks(&[chunk(&doc.id, 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(store.delete_document(&doc.id).await.unwrap());
        assert!(!store.delete_document(&doc.id).await.unwrap());
        assert!(store.chunks_for_document(&doc.id).await.unwrap().is_empty());
        assert!(store.search_chunks(&[1.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processed_and_error_states() {
        let store = InMemoryStore::new();
        let doc = store.create_document(&new_doc("abc")).await.unwrap();
        assert_eq!(doc.status(), "pending");
        store.record_error(&doc.id, "boom").await.unwrap();
        assert_eq!(store.get_document(&doc.id).await.unwrap().unwrap().status(), "failed");
        store
            .mark_processed(&doc.id, ProcessedStats { page_count: 3, word_count: 10 })
            .await
            .unwrap();
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert!(doc.is_processed());
        assert!(doc.error_message.is_none());
        assert_eq!(doc.page_count, Some(3));
    }
}
