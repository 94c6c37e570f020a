//! Query-time retrieval across the text and image spaces.
//!
//! The query is embedded once with the text embedder and that single vector
//! is searched against both indexes. The image space usually has a different
//! dimensionality, so an image search failure is an expected condition: it is
//! logged and turned into an empty image list, and the query is answered from
//! text alone. Text-side failures propagate.
//!
//! Hybrid mode post-filters the semantic chunk hits by keyword overlap with
//! the query, unless the filter would throw away more than half of them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::embedding::{OllamaEmbedder, TextEmbedder};
use crate::error::{deadline_token, with_cancel, RagError, Result};
use crate::models::{Chunk, Image, RetrievalResult, Scored};
use crate::store::sqlite::SqliteStore;
use crate::store::{DocumentStore, ImageIndex, TextIndex, VectorIndex};

/// Words ignored when extracting query keywords.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "what", "which", "who", "when", "where", "why", "how",
];

pub struct Retriever {
    embedder: Arc<dyn TextEmbedder>,
    text_index: Box<dyn VectorIndex<Item = Chunk>>,
    image_index: Box<dyn VectorIndex<Item = Image>>,
    top_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        text_index: Box<dyn VectorIndex<Item = Chunk>>,
        image_index: Box<dyn VectorIndex<Item = Image>>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            text_index,
            image_index,
            top_k,
        }
    }

    /// Retriever over both vector spaces of one store.
    pub fn from_store(
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn DocumentStore>,
        top_k: usize,
    ) -> Self {
        Self::new(
            embedder,
            Box::new(TextIndex::new(store.clone())),
            Box::new(ImageIndex::new(store)),
            top_k,
        )
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Nearest chunks and images for `query`, `top_k` of each.
    pub async fn retrieve(&self, query: &str, cancel: &CancellationToken) -> Result<RetrievalResult> {
        with_cancel(cancel, self.search(query)).await
    }

    /// Like [`retrieve`](Self::retrieve), then filter chunks by query keywords.
    pub async fn retrieve_hybrid(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrievalResult> {
        let mut result = self.retrieve(query, cancel).await?;
        let keywords = extract_keywords(query);
        result.chunks = filter_by_keywords(result.chunks, &keywords);
        Ok(result)
    }

    async fn search(&self, query: &str) -> Result<RetrievalResult> {
        let vector = self.embedder.embed(query).await?;

        let chunks = self.text_index.search(&vector, self.top_k).await?;
        let images = search_or_empty(self.image_index.as_ref(), &vector, self.top_k).await;

        debug!(
            chunks = chunks.len(),
            images = images.len(),
            "retrieved"
        );
        Ok(RetrievalResult { chunks, images })
    }
}

/// Search `index`, treating any failure as "no results".
async fn search_or_empty<T: Send>(
    index: &dyn VectorIndex<Item = T>,
    query: &[f32],
    k: usize,
) -> Vec<Scored<T>> {
    match index.search(query, k).await {
        Ok(hits) => hits,
        Err(RagError::DimensionMismatch { expected, actual }) => {
            debug!(
                index = index.name(),
                expected, actual, "query vector does not fit this index"
            );
            Vec::new()
        }
        Err(e) => {
            warn!(index = index.name(), error = %e, "search failed, continuing without it");
            Vec::new()
        }
    }
}

/// Lowercased query terms, minus punctuation, stop words and words of two
/// characters or fewer.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| {
            w.to_lowercase()
                .trim_matches(|c: char| ".,!?;:".contains(c))
                .to_string()
        })
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Keep chunks that mention at least one keyword.
///
/// Returns `chunks` unchanged when there are no keywords or when fewer than
/// half of them would survive.
pub fn filter_by_keywords(chunks: Vec<Scored<Chunk>>, keywords: &[String]) -> Vec<Scored<Chunk>> {
    if keywords.is_empty() {
        return chunks;
    }

    let total = chunks.len();
    let matched: Vec<bool> = chunks
        .iter()
        .map(|c| {
            let content = c.item.content.to_lowercase();
            keywords.iter().any(|k| content.contains(k.as_str()))
        })
        .collect();
    let kept = matched.iter().filter(|m| **m).count();

    if kept * 2 < total {
        debug!(kept, total, "keyword filter too aggressive, keeping semantic results");
        return chunks;
    }
    chunks
        .into_iter()
        .zip(matched)
        .filter_map(|(c, m)| m.then_some(c))
        .collect()
}

/// `docchat search`
pub async fn run_search(
    config: &Config,
    query: &str,
    hybrid: bool,
    limit: Option<usize>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::connect(config).await?);
    let embedder = Arc::new(OllamaEmbedder::new(config)?);
    let top_k = limit.unwrap_or(config.retrieval.top_k).max(1);
    let retriever = Retriever::from_store(embedder, store.clone(), top_k);

    let cancel = deadline_token(timeout_secs);
    let result = if hybrid || config.retrieval.hybrid {
        retriever.retrieve_hybrid(query, &cancel).await?
    } else {
        retriever.retrieve(query, &cancel).await?
    };

    if result.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    let mut names: HashMap<String, String> = HashMap::new();
    for id in result
        .chunks
        .iter()
        .map(|c| &c.item.document_id)
        .chain(result.images.iter().map(|i| &i.item.document_id))
    {
        if !names.contains_key(id) {
            let name = store
                .get_document(id)
                .await?
                .map(|d| d.file_name)
                .unwrap_or_else(|| "(deleted)".to_string());
            names.insert(id.clone(), name);
        }
    }

    for (i, hit) in result.chunks.iter().enumerate() {
        let excerpt: String = hit.item.content.chars().take(200).collect();
        println!(
            "{}. [{:.3}] {} #{}",
            i + 1,
            hit.distance,
            names[&hit.item.document_id],
            hit.item.chunk_index
        );
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", hit.item.id);
        println!();
    }

    if !result.images.is_empty() {
        println!("Images:");
        for (i, hit) in result.images.iter().enumerate() {
            println!(
                "{}. [{:.3}] {} / {}",
                i + 1,
                hit.distance,
                names[&hit.item.document_id],
                hit.item.file_path
            );
            if let Some(caption) = &hit.item.caption {
                println!("    caption: {}", caption);
            }
        }
        println!();
    }

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(content: &str) -> Scored<Chunk> {
        Scored {
            item: Chunk {
                id: content.to_string(),
                document_id: "d".to_string(),
                chunk_index: 0,
                content: content.to_string(),
                embedding: None,
            },
            distance: 0.0,
        }
    }

    #[test]
    fn test_extract_keywords() {
        let keywords = extract_keywords("What is the Migration pattern of spiders?");
        assert_eq!(keywords, vec!["migration", "pattern", "spiders"]);
        assert!(extract_keywords("is it to be?").is_empty());
    }

    #[test]
    fn test_filter_keeps_matches() {
        let chunks = vec![
            scored("Spiders spin webs"),
            scored("Orb weavers are spiders"),
            scored("tax law"),
        ];
        let kept = filter_by_keywords(chunks, &["spiders".to_string()]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].item.content, "Spiders spin webs");
    }

    #[test]
    fn test_filter_guard_against_over_filtering() {
        let chunks = vec![
            scored("spiders"),
            scored("tax law"),
            scored("cooking"),
            scored("gardening"),
        ];
        let kept = filter_by_keywords(chunks, &["spiders".to_string()]);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_filter_exactly_half_is_kept() {
        let chunks = vec![scored("spiders"), scored("tax law")];
        let kept = filter_by_keywords(chunks, &["spiders".to_string()]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_filter_without_keywords_is_identity() {
        let chunks = vec![scored("a"), scored("b")];
        assert_eq!(filter_by_keywords(chunks, &[]).len(), 2);
    }
}
