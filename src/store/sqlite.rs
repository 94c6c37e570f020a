//! SQLite-backed [`DocumentStore`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs on the `chunks` and
//! `images` rows. Nearest-neighbour search loads the populated vectors of
//! one space in rowid order and ranks them by cosine distance in Rust.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::migrate;
use crate::models::{
    Chunk, Conversation, Document, FileType, Image, NewDocument, ProcessedStats, Scored,
    StoreStats, TypeStats,
};

use super::{rank_by_distance, DocumentStore};

const DOCUMENT_COLUMNS: &str = "id, file_path, file_name, file_type, file_hash, page_count, \
     word_count, processed_at, error_message, created_at, updated_at";

/// SQLite implementation of the [`DocumentStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the configured database and make sure the schema exists.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let file_type: String = row.get("file_type");
    let file_type = FileType::parse(&file_type)
        .ok_or_else(|| RagError::Store(format!("unknown file type in database: {}", file_type)))?;
    Ok(Document {
        id: row.get("id"),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        file_type,
        file_hash: row.get("file_hash"),
        page_count: row.get("page_count"),
        word_count: row.get("word_count"),
        processed_at: row.get("processed_at"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        embedding: blob.map(|b| blob_to_vec(&b)),
    }
}

fn image_from_row(row: &SqliteRow) -> Image {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Image {
        id: row.get("id"),
        document_id: row.get("document_id"),
        image_index: row.get("image_index"),
        file_path: row.get("file_path"),
        caption: row.get("caption"),
        embedding: blob.map(|b| blob_to_vec(&b)),
    }
}

/// Split loaded rows into `(item, vector)` candidates, leaving the item's copy empty.
fn with_vectors<T>(items: Vec<T>, take: impl Fn(&mut T) -> Option<Vec<f32>>) -> Vec<(T, Vec<f32>)> {
    items
        .into_iter()
        .filter_map(|mut item| take(&mut item).map(|v| (item, v)))
        .collect()
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find_by_hash(&self, file_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE file_hash = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn create_document(&self, doc: &NewDocument) -> Result<Document> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        sqlx::query(
            r#"
            INSERT INTO documents (id, file_path, file_name, file_type, file_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&doc.file_path)
        .bind(&doc.file_name)
        .bind(doc.file_type.as_str())
        .bind(&doc.file_hash)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(Document {
            id,
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
        })
    }

    async fn mark_processed(&self, id: &str, stats: ProcessedStats) -> Result<()> {
        let ts = now();
        sqlx::query(
            r#"
            UPDATE documents
            SET processed_at = ?, error_message = NULL, page_count = ?, word_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ts)
        .bind(stats.page_count)
        .bind(stats.word_count)
        .bind(ts)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET error_message = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        // chunks and images follow via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_images(&self, images: &[Image]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for image in images {
            sqlx::query(
                "INSERT INTO images (id, document_id, image_index, file_path, caption, embedding) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&image.id)
            .bind(&image.document_id)
            .bind(image.image_index)
            .bind(&image.file_path)
            .bind(&image.caption)
            .bind(image.embedding.as_deref().map(vec_to_blob))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn images_for_document(&self, document_id: &str) -> Result<Vec<Image>> {
        let rows = sqlx::query(
            "SELECT id, document_id, image_index, file_path, caption, embedding FROM images WHERE document_id = ? ORDER BY image_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(image_from_row).collect())
    }

    async fn pending_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query(
            "SELECT id, document_id, image_index, file_path, caption, embedding FROM images WHERE embedding IS NULL ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(image_from_row).collect())
    }

    async fn update_image(&self, id: &str, caption: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE images SET caption = ?, embedding = ? WHERE id = ?")
            .bind(caption)
            .bind(vec_to_blob(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_image_embeddings(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE images SET caption = NULL, embedding = NULL WHERE caption IS NOT NULL OR embedding IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn search_chunks(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Chunk>>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding FROM chunks WHERE embedding IS NOT NULL ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        let chunks: Vec<Chunk> = rows.iter().map(chunk_from_row).collect();
        rank_by_distance(with_vectors(chunks, |c| c.embedding.take()), query, limit)
    }

    async fn search_images(&self, query: &[f32], limit: usize) -> Result<Vec<Scored<Image>>> {
        let rows = sqlx::query(
            "SELECT id, document_id, image_index, file_path, caption, embedding FROM images WHERE embedding IS NOT NULL ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        let images: Vec<Image> = rows.iter().map(image_from_row).collect();
        rank_by_distance(with_vectors(images, |i| i.embedding.take()), query, limit)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let chunk_ids = serde_json::to_string(&conversation.context_chunk_ids)
            .map_err(|e| RagError::Store(e.to_string()))?;
        let image_ids = serde_json::to_string(&conversation.context_image_ids)
            .map_err(|e| RagError::Store(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_message, assistant_message, model_name,
                                       context_chunk_ids, context_image_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.user_message)
        .bind(&conversation.assistant_message)
        .bind(&conversation.model_name)
        .bind(chunk_ids)
        .bind(image_ids)
        .bind(conversation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS documents,
                COALESCE(SUM(CASE WHEN processed_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS processed,
                COALESCE(SUM(CASE WHEN processed_at IS NULL AND error_message IS NOT NULL THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(page_count), 0) AS pages,
                COALESCE(SUM(word_count), 0) AS words
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        let embedded_images: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let documents_with_images: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT document_id) FROM images")
                .fetch_one(&self.pool)
                .await?;
        let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;

        let type_rows = sqlx::query(
            r#"
            SELECT
                d.file_type AS file_type,
                COUNT(*) AS documents,
                (SELECT COUNT(*) FROM chunks c JOIN documents d2 ON d2.id = c.document_id
                 WHERE d2.file_type = d.file_type) AS chunks,
                (SELECT COUNT(*) FROM images i JOIN documents d3 ON d3.id = i.document_id
                 WHERE d3.file_type = d.file_type) AS images
            FROM documents d
            GROUP BY d.file_type
            ORDER BY d.file_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(StoreStats {
            documents: row.get("documents"),
            processed_documents: row.get("processed"),
            failed_documents: row.get("failed"),
            chunks,
            images,
            embedded_images,
            pages: row.get("pages"),
            words: row.get("words"),
            documents_with_images,
            conversations,
            by_type: type_rows
                .iter()
                .map(|r| TypeStats {
                    file_type: r.get("file_type"),
                    documents: r.get("documents"),
                    chunks: r.get("chunks"),
                    images: r.get("images"),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        let mut config = Config::default();
        config.db.path = tmp.path().join("data").join("docchat.sqlite");
        SqliteStore::connect(&config).await.unwrap()
    }

    fn new_doc(hash: &str) -> NewDocument {
        NewDocument {
            file_path: format!("/docs/{}.epub", hash),
            file_name: format!("{}.epub", hash),
            file_type: FileType::Epub,
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
    async fn test_hash_is_unique() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        store.create_document(&new_doc("h1")).await.unwrap();
        assert!(store.create_document(&new_doc("h1")).await.is_err());
        let found = store.find_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(found.file_type, FileType::Epub);
        assert!(store.find_by_hash("h2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunk_batch_is_atomic() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let doc = store.create_document(&new_doc("h1")).await.unwrap();
        let batch = vec![
            chunk(&doc.id, 0, vec![1.0, 0.0]),
            chunk(&doc.id, 1, vec![0.0, 1.0]),
            chunk(&doc.id, 1, vec![0.5, 0.5]),
        ];
        assert!(store.insert_chunks(&batch).await.is_err());
        assert!(store.chunks_for_document(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_chunks_and_images() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let doc = store.create_document(&new_doc("h1")).await.unwrap();
        store
            .insert_chunks(&[chunk(&doc.id, 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .insert_images(&[Image {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                image_index: 0,
                file_path: "/tmp/x.png".to_string(),
                caption: Some("x".to_string()),
                embedding: Some(vec![0.1; 4]),
            }])
            .await
            .unwrap();

        assert!(store.delete_document(&doc.id).await.unwrap());
        let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!((chunks, images), (0, 0));
    }

    #[tokio::test]
    async fn test_search_ranks_and_checks_dimensions() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let doc = store.create_document(&new_doc("h1")).await.unwrap();
        store
            .insert_chunks(&[
                chunk(&doc.id, 0, vec![0.0, 1.0]),
                chunk(&doc.id, 1, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.search_chunks(&[1.0, 0.1], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.chunk_index, 1);

        let err = store.search_chunks(&[1.0, 0.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_image_backfill_and_reset() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let doc = store.create_document(&new_doc("h1")).await.unwrap();
        let image_id = Uuid::new_v4().to_string();
        store
            .insert_images(&[Image {
                id: image_id.clone(),
                document_id: doc.id.clone(),
                image_index: 0,
                file_path: "/tmp/x.png".to_string(),
                caption: None,
                embedding: None,
            }])
            .await
            .unwrap();

        assert_eq!(store.pending_images().await.unwrap().len(), 1);
        store.update_image(&image_id, "a chart", &[0.5; 4]).await.unwrap();
        assert!(store.pending_images().await.unwrap().is_empty());
        let images = store.images_for_document(&doc.id).await.unwrap();
        assert_eq!(images[0].caption.as_deref(), Some("a chart"));
        assert_eq!(images[0].embedding.as_ref().map(|v| v.len()), Some(4));

        assert_eq!(store.reset_image_embeddings().await.unwrap(), 1);
        assert_eq!(store.pending_images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_conversations() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let ok = store.create_document(&new_doc("h1")).await.unwrap();
        let failed = store.create_document(&new_doc("h2")).await.unwrap();
        store
            .mark_processed(&ok.id, ProcessedStats { page_count: 4, word_count: 900 })
            .await
            .unwrap();
        store.record_error(&failed.id, "parse failed").await.unwrap();
        store
            .insert_chunks(&[chunk(&ok.id, 0, vec![1.0])])
            .await
            .unwrap();
        store
            .save_conversation(&Conversation {
                id: Uuid::new_v4().to_string(),
                user_message: "q".to_string(),
                assistant_message: "a".to_string(),
                model_name: "llama3.2".to_string(),
                context_chunk_ids: vec!["c1".to_string()],
                context_image_ids: vec![],
                created_at: now(),
            })
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.processed_documents, 1);
        assert_eq!(stats.failed_documents, 1);
        assert_eq!(stats.pages, 4);
        assert_eq!(stats.words, 900);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.by_type.len(), 1);
        assert_eq!(stats.by_type[0].documents, 2);

        let failed = store.get_document(&failed.id).await.unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("parse failed"));
        assert!(failed.processed_at.is_none());
    }
}
