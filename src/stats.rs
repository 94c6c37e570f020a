//! Library statistics and health overview.
//!
//! Provides a quick summary of what's indexed: document states, chunk and
//! image counts, embedding coverage of images, and a per-format breakdown.
//! Used by `docchat stats`.

use anyhow::Result;

use crate::config::Config;
use crate::models::StoreStats;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::connect(config).await?;
    let stats = store.stats().await?;
    store.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    print!("{}", render(&stats, &config.db.path.display().to_string(), db_size));
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

fn render(stats: &StoreStats, db_path: &str, db_size: u64) -> String {
    let pending = stats.documents - stats.processed_documents - stats.failed_documents;
    let mut out = String::new();
    out.push_str("docchat Library Stats\n");
    out.push_str("=====================\n\n");
    out.push_str(&format!("  Database:    {}\n", db_path));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(db_size)));
    out.push_str(&format!(
        "  Documents:   {} ({} processed, {} failed, {} pending)\n",
        stats.documents, stats.processed_documents, stats.failed_documents, pending
    ));
    out.push_str(&format!("  Pages:       {}\n", stats.pages));
    out.push_str(&format!("  Words:       {}\n", stats.words));
    out.push_str(&format!("  Chunks:      {}\n", stats.chunks));
    out.push_str(&format!(
        "  Images:      {} / {} embedded ({}%)\n",
        stats.embedded_images,
        stats.images,
        percent(stats.embedded_images, stats.images)
    ));
    out.push_str(&format!(
        "  With images: {} documents\n",
        stats.documents_with_images
    ));
    out.push_str(&format!("  Conversations: {}\n", stats.conversations));

    if !stats.by_type.is_empty() {
        out.push_str("\n  By type:\n");
        out.push_str(&format!(
            "  {:<8} {:>6} {:>8} {:>8}\n",
            "TYPE", "DOCS", "CHUNKS", "IMAGES"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(34)));
        for t in &stats.by_type {
            out.push_str(&format!(
                "  {:<8} {:>6} {:>8} {:>8}\n",
                t.file_type, t.documents, t.chunks, t.images
            ));
        }
    }
    out.push('\n');
    out
}

/// Format a byte count as a human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TypeStats;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_render_counts() {
        let stats = StoreStats {
            documents: 4,
            processed_documents: 2,
            failed_documents: 1,
            chunks: 30,
            images: 4,
            embedded_images: 3,
            by_type: vec![TypeStats {
                file_type: "pdf".to_string(),
                documents: 4,
                chunks: 30,
                images: 4,
            }],
            ..StoreStats::default()
        };
        let text = render(&stats, "db.sqlite", 0);
        assert!(text.contains("4 (2 processed, 1 failed, 1 pending)"));
        assert!(text.contains("3 / 4 embedded (75%)"));
        assert!(text.contains("By type:"));
    }
}
