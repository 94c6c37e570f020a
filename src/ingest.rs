//! Ingestion pipeline orchestration.
//!
//! Coordinates the per-file flow: hash → dedup lookup → parse → chunk →
//! embed → store → images → mark processed. Ingestion is incremental:
//! a file whose bytes hash to an already known document is never touched
//! again, whatever its path.
//!
//! Text and images fail differently. Any chunk embedding or chunk insert
//! failure aborts the document and is recorded on its row; a failed image
//! is skipped and only counted.
//!
//! # Pipeline
//!
//! ```text
//! hash ──▶ known? ──yes──▶ AlreadyProcessed
//!            │no
//!            ▼
//!       file type ──▶ create row ──▶ parse ──▶ chunk ──▶ embed (sequential, hard stop)
//!                                                             │
//!                          mark processed ◀── insert images ◀─┴─ insert chunks (atomic)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{split_text, word_count};
use crate::config::{ChunkingConfig, Config};
use crate::embedding::{OllamaEmbedder, TextEmbedder};
use crate::error::{check_cancel, deadline_token, with_cancel, RagError, Result};
use crate::extract::{DocumentParser, ExtractedImage, FileParser, ParsedDocument};
use crate::hash::hash_file;
use crate::image_embed::{create_image_embedder, ImageEmbedder};
use crate::models::{Chunk, Document, FileType, Image, NewDocument, ProcessedStats};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, ProgressMode};
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

/// What happened to one file.
#[derive(Debug)]
pub enum IngestOutcome {
    /// A document with the same content hash already exists. Nothing was written.
    AlreadyProcessed { document: Document },
    /// The file ran through the full pipeline.
    Processed(IngestReport),
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: usize,
    pub images_stored: usize,
    pub images_skipped: usize,
    pub page_count: usize,
    pub word_count: usize,
}

/// Images that made it through captioning, and how many did not.
#[derive(Debug, Default)]
struct ImageBatch {
    stored: Vec<Image>,
    skipped: usize,
}

/// Totals across a multi-file run.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub files: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Stored documents whose source file no longer exists.
    pub missing: usize,
    pub chunks: usize,
    pub images_stored: usize,
    pub images_skipped: usize,
    pub failures: Vec<(String, String)>,
}

impl IngestSummary {
    /// Fold one file's outcome in. Only cancellation stops the run.
    fn record(&mut self, path: &Path, result: Result<IngestOutcome>) -> Result<()> {
        match result {
            Ok(IngestOutcome::Processed(report)) => {
                self.processed += 1;
                self.chunks += report.chunks;
                self.images_stored += report.images_stored;
                self.images_skipped += report.images_skipped;
            }
            Ok(IngestOutcome::AlreadyProcessed { .. }) => self.skipped += 1,
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ingestion failed");
                self.failed += 1;
                self.failures
                    .push((path.display().to_string(), e.to_string()));
            }
        }
        Ok(())
    }
}

/// Counts from an image backfill pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageBackfill {
    pub processed: usize,
    pub failed: usize,
}

/// Runs documents through the ingestion pipeline.
pub struct Processor {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn TextEmbedder>,
    image_embedder: Arc<dyn ImageEmbedder>,
    parser: Arc<dyn DocumentParser>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Processor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn TextEmbedder>,
        image_embedder: Arc<dyn ImageEmbedder>,
        parser: Arc<dyn DocumentParser>,
        chunking: &ChunkingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            image_embedder,
            parser,
            chunk_size: chunking.chunk_size,
            chunk_overlap: chunking.chunk_overlap,
        }
    }

    /// Wire the production backends from configuration.
    pub async fn from_config(config: &Config, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let image_dir = config
            .images
            .enabled
            .then(|| config.images.dir.clone());
        Ok(Self::new(
            store,
            Arc::new(OllamaEmbedder::new(config)?),
            create_image_embedder(&config.images).await,
            Arc::new(FileParser::new(image_dir)),
            &config.chunking,
        ))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Ingest one file. Idempotent per content hash.
    ///
    /// Any failure after the document row is created is recorded on that row
    /// before being returned, cancellation included.
    pub async fn process_document(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        check_cancel(cancel)?;
        let file_hash = with_cancel(cancel, hash_file(path)).await?;

        if let Some(document) = self.store.find_by_hash(&file_hash).await? {
            debug!(path = %path.display(), id = %document.id, "unchanged, skipping");
            return Ok(IngestOutcome::AlreadyProcessed { document });
        }

        let file_type = FileType::from_path(path)?;
        let file_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let document = self
            .store
            .create_document(&NewDocument {
                file_path: file_path.display().to_string(),
                file_name,
                file_type,
                file_hash,
            })
            .await?;
        info!(path = %path.display(), id = %document.id, "new document");

        match self.run_pipeline(&document, path, cancel).await {
            Ok(report) => Ok(IngestOutcome::Processed(report)),
            Err(e) => {
                if let Err(record_err) = self.store.record_error(&document.id, &e.to_string()).await
                {
                    warn!(id = %document.id, error = %record_err, "could not record failure");
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        document: &Document,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let parsed = with_cancel(cancel, self.parse(path)).await?;
        debug!(
            id = %document.id,
            pages = parsed.page_count,
            images = parsed.images.len(),
            "parsed"
        );

        let chunks = self.embed_chunks(&document.id, &parsed.text, cancel).await?;
        check_cancel(cancel)?;
        self.store.insert_chunks(&chunks).await?;

        let images = self
            .embed_images(&document.id, &parsed.images, cancel)
            .await?;
        if !images.stored.is_empty() {
            check_cancel(cancel)?;
            self.store.insert_images(&images.stored).await?;
        }

        let words = word_count(&parsed.text);
        self.store
            .mark_processed(
                &document.id,
                ProcessedStats {
                    page_count: parsed.page_count as i64,
                    word_count: words as i64,
                },
            )
            .await?;

        info!(
            id = %document.id,
            chunks = chunks.len(),
            images = images.stored.len(),
            images_skipped = images.skipped,
            "processed"
        );
        Ok(IngestReport {
            document_id: document.id.clone(),
            chunks: chunks.len(),
            images_stored: images.stored.len(),
            images_skipped: images.skipped,
            page_count: parsed.page_count,
            word_count: words,
        })
    }

    async fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let parser = Arc::clone(&self.parser);
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || parser.parse(&owned))
            .await
            .map_err(|e| RagError::parse(path, format!("parser task failed: {}", e)))?
    }

    /// Chunk and embed the text. The first failed call aborts the document.
    async fn embed_chunks(
        &self,
        document_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Chunk>> {
        let pieces = split_text(text, self.chunk_size, self.chunk_overlap);
        if pieces.is_empty() {
            warn!(id = %document_id, "document has no extractable text");
        }

        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, content) in pieces.into_iter().enumerate() {
            let embedding = with_cancel(cancel, self.embedder.embed(&content)).await?;
            if embedding.len() != self.embedder.dims() {
                return Err(RagError::DimensionMismatch {
                    expected: self.embedder.dims(),
                    actual: embedding.len(),
                });
            }
            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: index as i64,
                content,
                embedding: Some(embedding),
            });
        }
        Ok(chunks)
    }

    /// Caption and embed each image independently, skipping failures.
    async fn embed_images(
        &self,
        document_id: &str,
        extracted: &[ExtractedImage],
        cancel: &CancellationToken,
    ) -> Result<ImageBatch> {
        let mut batch = ImageBatch::default();
        for image in extracted {
            match with_cancel(cancel, self.image_embedder.process(&image.file_path)).await {
                Ok(result) if result.embedding.len() == self.image_embedder.dims() => {
                    batch.stored.push(Image {
                        id: Uuid::new_v4().to_string(),
                        document_id: document_id.to_string(),
                        image_index: image.index as i64,
                        file_path: image.file_path.display().to_string(),
                        caption: Some(result.caption),
                        embedding: Some(result.embedding),
                    });
                }
                Ok(result) => {
                    warn!(
                        image = %image.file_path.display(),
                        dims = result.embedding.len(),
                        "image embedding has the wrong dimension, skipping"
                    );
                    batch.skipped += 1;
                }
                Err(RagError::Cancelled) => return Err(RagError::Cancelled),
                Err(e) => {
                    warn!(image = %image.file_path.display(), error = %e, "skipping image");
                    batch.skipped += 1;
                }
            }
        }
        Ok(batch)
    }

    /// Delete any document with this file's current hash, then ingest it again.
    pub async fn reprocess(&self, path: &Path, cancel: &CancellationToken) -> Result<IngestOutcome> {
        check_cancel(cancel)?;
        let file_hash = with_cancel(cancel, hash_file(path)).await?;
        if let Some(existing) = self.store.find_by_hash(&file_hash).await? {
            info!(path = %path.display(), id = %existing.id, "removing previous ingestion");
            self.store.delete_document(&existing.id).await?;
        }
        self.process_document(path, cancel).await
    }

    /// Drop a stored document and ingest its source file again.
    async fn reingest(&self, document: &Document, cancel: &CancellationToken) -> Result<IngestOutcome> {
        check_cancel(cancel)?;
        self.store.delete_document(&document.id).await?;
        self.process_document(Path::new(&document.file_path), cancel)
            .await
    }

    /// Ingest every file under `paths`. Directories are walked recursively.
    ///
    /// Per-file failures are counted, not returned. With `force`, files that
    /// were already ingested are reprocessed.
    pub async fn ingest_paths(
        &self,
        paths: &[PathBuf],
        force: bool,
        cancel: &CancellationToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestSummary> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_dir() {
                progress.report(IngestProgressEvent::Discovering {
                    root: path.display().to_string(),
                });
                files.extend(discover_documents(path)?);
            } else {
                files.push(path.clone());
            }
        }

        let mut summary = IngestSummary {
            files: files.len(),
            ..IngestSummary::default()
        };
        let total = files.len() as u64;
        for (n, file) in files.iter().enumerate() {
            progress.report(IngestProgressEvent::Processing {
                file: file.display().to_string(),
                n: n as u64 + 1,
                total,
            });
            let result = if force {
                self.reprocess(file, cancel).await
            } else {
                self.process_document(file, cancel).await
            };
            summary.record(file, result)?;
        }
        Ok(summary)
    }

    /// Reprocess every stored document whose source file still exists.
    pub async fn reprocess_all(
        &self,
        cancel: &CancellationToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestSummary> {
        let documents = self.store.list_documents().await?;
        self.reingest_each(documents, cancel, progress).await
    }

    /// Reprocess every document that never finished processing.
    pub async fn retry_failed(
        &self,
        cancel: &CancellationToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestSummary> {
        let documents: Vec<Document> = self
            .store
            .list_documents()
            .await?
            .into_iter()
            .filter(|d| !d.is_processed())
            .collect();
        self.reingest_each(documents, cancel, progress).await
    }

    async fn reingest_each(
        &self,
        documents: Vec<Document>,
        cancel: &CancellationToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            files: documents.len(),
            ..IngestSummary::default()
        };
        let total = documents.len() as u64;
        for (n, document) in documents.iter().enumerate() {
            let path = Path::new(&document.file_path);
            if !path.is_file() {
                warn!(path = %path.display(), id = %document.id, "source file is gone, skipping");
                summary.missing += 1;
                continue;
            }
            progress.report(IngestProgressEvent::Processing {
                file: document.file_path.clone(),
                n: n as u64 + 1,
                total,
            });
            let result = self.reingest(document, cancel).await;
            summary.record(path, result)?;
        }
        Ok(summary)
    }

    /// Caption and embed every stored image that still lacks an embedding.
    pub async fn process_pending_images(
        &self,
        cancel: &CancellationToken,
        progress: &dyn IngestProgressReporter,
    ) -> Result<ImageBackfill> {
        let pending = self.store.pending_images().await?;
        let total = pending.len() as u64;
        let mut counts = ImageBackfill::default();

        for (n, image) in pending.iter().enumerate() {
            progress.report(IngestProgressEvent::Captioning {
                n: n as u64,
                total,
            });
            let path = Path::new(&image.file_path);
            match with_cancel(cancel, self.image_embedder.process(path)).await {
                Ok(result) if result.embedding.len() == self.image_embedder.dims() => {
                    self.store
                        .update_image(&image.id, &result.caption, &result.embedding)
                        .await?;
                    counts.processed += 1;
                }
                Ok(_) => {
                    warn!(image = %image.file_path, "image embedding has the wrong dimension");
                    counts.failed += 1;
                }
                Err(RagError::Cancelled) => return Err(RagError::Cancelled),
                Err(e) => {
                    warn!(image = %image.file_path, error = %e, "image backfill failed");
                    counts.failed += 1;
                }
            }
        }
        if total > 0 {
            progress.report(IngestProgressEvent::Captioning { n: total, total });
        }
        Ok(counts)
    }

    /// Clear captions and embeddings on all images so they can be redone.
    pub async fn reset_images(&self) -> Result<u64> {
        self.store.reset_image_embeddings().await
    }
}

/// Recursively collect `.pdf` and `.epub` files under `root`, sorted.
pub fn discover_documents(root: &Path) -> Result<Vec<PathBuf>> {
    let matcher = document_globs()?;
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| RagError::io(root, e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.is_match(entry.file_name()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn document_globs() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["*.pdf", "*.epub"] {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| RagError::Store(format!("invalid glob {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RagError::Store(format!("invalid glob set: {}", e)))
}

async fn open_processor(config: &Config) -> anyhow::Result<(Arc<SqliteStore>, Processor)> {
    let store = Arc::new(SqliteStore::connect(config).await?);
    let processor = Processor::from_config(config, store.clone())
        .await
        .context("Failed to set up the ingestion pipeline")?;
    Ok((store, processor))
}

fn print_summary(title: &str, summary: &IngestSummary) {
    println!("{}", title);
    println!("  files: {}", summary.files);
    println!("  processed: {}", summary.processed);
    println!("  skipped (unchanged): {}", summary.skipped);
    println!("  failed: {}", summary.failed);
    if summary.missing > 0 {
        println!("  missing source files: {}", summary.missing);
    }
    println!("  chunks written: {}", summary.chunks);
    println!("  images stored: {}", summary.images_stored);
    println!("  images skipped: {}", summary.images_skipped);
    for (path, error) in &summary.failures {
        println!("  error: {}: {}", path, error);
    }
}

/// Fail the command only when nothing at all succeeded.
fn finish(summary: &IngestSummary) -> anyhow::Result<()> {
    if summary.failed > 0 && summary.processed == 0 && summary.skipped == 0 {
        bail!("no documents ingested ({} failed)", summary.failed);
    }
    println!("ok");
    Ok(())
}

/// `docchat ingest`
pub async fn run_ingest(
    config: &Config,
    paths: &[PathBuf],
    force: bool,
    timeout_secs: Option<u64>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let paths = if paths.is_empty() {
        let dir = config.ingest.documents_dir.clone();
        if !dir.is_dir() {
            bail!("documents directory does not exist: {}", dir.display());
        }
        vec![dir]
    } else {
        paths.to_vec()
    };

    let (store, processor) = open_processor(config).await?;
    let cancel = deadline_token(timeout_secs);
    let summary = processor
        .ingest_paths(&paths, force, &cancel, progress.reporter().as_ref())
        .await?;
    store.close().await;

    print_summary("ingest", &summary);
    finish(&summary)
}

/// `docchat reprocess`
pub async fn run_reprocess(
    config: &Config,
    paths: &[PathBuf],
    all: bool,
    failed: bool,
    timeout_secs: Option<u64>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let (store, processor) = open_processor(config).await?;
    let cancel = deadline_token(timeout_secs);
    let reporter = progress.reporter();

    let summary = if all {
        processor.reprocess_all(&cancel, reporter.as_ref()).await?
    } else if failed {
        processor.retry_failed(&cancel, reporter.as_ref()).await?
    } else if paths.is_empty() {
        bail!("nothing to reprocess: pass file paths, --all or --failed");
    } else {
        processor
            .ingest_paths(paths, true, &cancel, reporter.as_ref())
            .await?
    };
    store.close().await;

    print_summary("reprocess", &summary);
    finish(&summary)
}

/// `docchat images pending`
pub async fn run_images_pending(
    config: &Config,
    timeout_secs: Option<u64>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let (store, processor) = open_processor(config).await?;
    let cancel = deadline_token(timeout_secs);
    let counts = processor
        .process_pending_images(&cancel, progress.reporter().as_ref())
        .await?;
    store.close().await;

    println!("images pending");
    println!("  processed: {}", counts.processed);
    println!("  failed: {}", counts.failed);
    println!("ok");
    Ok(())
}

/// `docchat images reset`
pub async fn run_images_reset(config: &Config) -> anyhow::Result<()> {
    let (store, processor) = open_processor(config).await?;
    let cleared = processor.reset_images().await?;
    store.close().await;

    println!("images reset");
    println!("  cleared: {}", cleared);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_filters_by_extension() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("shelf").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("a.pdf"), b"x").unwrap();
        std::fs::write(nested.join("B.EPUB"), b"x").unwrap();
        std::fs::write(nested.join("notes.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("pdf"), b"x").unwrap();

        let found = discover_documents(tmp.path()).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found.len(), 2);
        assert!(names.contains(&"a.pdf".to_string()));
        assert!(names.contains(&"B.EPUB".to_string()));
    }

    #[test]
    fn test_summary_counts_and_stops_on_cancel() {
        let mut summary = IngestSummary::default();
        summary
            .record(
                Path::new("a.pdf"),
                Ok(IngestOutcome::Processed(IngestReport {
                    chunks: 3,
                    images_stored: 1,
                    images_skipped: 2,
                    ..IngestReport::default()
                })),
            )
            .unwrap();
        summary
            .record(Path::new("b.pdf"), Err(RagError::backend("down")))
            .unwrap();
        assert!(summary
            .record(Path::new("c.pdf"), Err(RagError::Cancelled))
            .is_err());

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.images_skipped, 2);
        assert_eq!(summary.failures[0].0, "b.pdf");
    }
}
