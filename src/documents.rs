//! Document listing, inspection and deletion.
//!
//! Backs `docchat docs list | show | delete`. Failed documents stay listed
//! with their error so the user can see why and reprocess them.

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::Config;
use crate::models::Document;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn or_dash(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
}

/// `docchat docs list`
pub async fn run_docs_list(config: &Config) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let documents = store.list_documents().await?;
    store.close().await;

    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    println!(
        "  {:<36}  {:<5} {:<9} {:>6} {:>8}  {:<16}  {}",
        "ID", "TYPE", "STATUS", "PAGES", "WORDS", "ADDED", "FILE"
    );
    println!("  {}", "-".repeat(110));
    for doc in &documents {
        println!(
            "  {:<36}  {:<5} {:<9} {:>6} {:>8}  {:<16}  {}",
            doc.id,
            doc.file_type,
            doc.status(),
            or_dash(doc.page_count),
            or_dash(doc.word_count),
            format_ts_iso(doc.created_at),
            doc.file_name
        );
        if let Some(err) = &doc.error_message {
            println!("      error: {}", err);
        }
    }
    Ok(())
}

async fn find_document(store: &SqliteStore, id: &str) -> Result<Document> {
    match store.get_document(id).await? {
        Some(doc) => Ok(doc),
        None => bail!("document not found: {}", id),
    }
}

/// `docchat docs show <id>`
pub async fn run_docs_show(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let doc = match find_document(&store, id).await {
        Ok(d) => d,
        Err(e) => {
            store.close().await;
            return Err(e);
        }
    };
    let chunks = store.chunks_for_document(&doc.id).await?;
    let images = store.images_for_document(&doc.id).await?;
    store.close().await;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("file:         {}", doc.file_path);
    println!("type:         {}", doc.file_type);
    println!("hash:         {}", doc.file_hash);
    println!("status:       {}", doc.status());
    println!("pages:        {}", or_dash(doc.page_count));
    println!("words:        {}", or_dash(doc.word_count));
    println!("created_at:   {}", format_ts_iso(doc.created_at));
    println!("updated_at:   {}", format_ts_iso(doc.updated_at));
    if let Some(ts) = doc.processed_at {
        println!("processed_at: {}", format_ts_iso(ts));
    }
    if let Some(err) = &doc.error_message {
        println!("error:        {}", err);
    }
    println!();

    println!("--- Chunks ({}) ---", chunks.len());
    for chunk in &chunks {
        let preview: String = chunk.content.chars().take(160).collect();
        println!("[chunk {}] {}", chunk.chunk_index, preview.replace('\n', " "));
    }
    println!();

    println!("--- Images ({}) ---", images.len());
    for image in &images {
        let state = if image.embedding.is_some() {
            "embedded"
        } else {
            "pending"
        };
        println!("[image {}] {} ({})", image.image_index, image.file_path, state);
        if let Some(caption) = &image.caption {
            println!("    caption: {}", caption);
        }
    }
    Ok(())
}

/// `docchat docs delete <id>`
///
/// Removes the row (chunks and images cascade) and the extracted image files.
pub async fn run_docs_delete(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let doc = match find_document(&store, id).await {
        Ok(d) => d,
        Err(e) => {
            store.close().await;
            return Err(e);
        }
    };

    let images = store.images_for_document(&doc.id).await?;
    store.delete_document(&doc.id).await?;
    store.close().await;

    let mut removed = 0usize;
    for image in &images {
        match std::fs::remove_file(&image.file_path) {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %image.file_path, error = %e, "could not remove image file"),
        }
    }

    println!("deleted {} ({})", doc.id, doc.file_name);
    println!("  image files removed: {}", removed);
    println!("ok");
    Ok(())
}
