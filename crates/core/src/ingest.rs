use crate::chunking::{ChunkingConfig, TextChunker};
use crate::enrich::{ChunkSlot, DocumentContext, FileFacts, MetadataEnricher, PatternSet};
use crate::extractor::extract_file;
use crate::index::IndexBuilder;
use crate::models::{ChunkRecord, FileType, IngestionOptions, PageId};
use crate::traits::{Embedder, EntityRecognizer, VectorStore};
use crate::IngestError;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const MAX_WORKERS: usize = 8;

/// Available parallelism minus one, kept within `1..=8`.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .clamp(1, MAX_WORKERS)
}

/// Every file under `root` with a registered suffix, sorted.
pub fn discover_documents(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if !root.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "document root does not exist: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for item in WalkDir::new(root) {
        let entry = match item {
            Ok(entry) => entry,
            Err(error) => {
                let path = error.path().map(|path| path.display().to_string());
                warn!(error = %error, path = ?path, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && FileType::from_path(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    Ok(files)
}

/// Path relative to `root` with `/` separators, the document's stable identity.
pub fn relative_filename(root: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();

    if parts.is_empty() {
        return Err(IngestError::MissingFileName(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Output of one successfully processed file.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub filename: String,
    pub chunks: Vec<String>,
    pub records: Vec<ChunkRecord>,
}

#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub result: Result<ProcessedFile, IngestError>,
}

/// Runs extraction, chunking and enrichment for many files on a worker pool.
///
/// Workers share nothing mutable; each file's result is sent back as soon as
/// it is ready, in completion order.
#[derive(Debug)]
pub struct ExtractionOrchestrator {
    root: PathBuf,
    chunker: TextChunker,
    enricher: MetadataEnricher,
    workers: usize,
}

impl ExtractionOrchestrator {
    pub fn new(root: impl Into<PathBuf>, options: &IngestionOptions) -> Result<Self, IngestError> {
        let chunker = TextChunker::new(ChunkingConfig::try_from(options)?)?;
        let enricher = MetadataEnricher::new(PatternSet::compile(&options.patterns)?);
        Ok(Self {
            root: root.into(),
            chunker,
            enricher,
            workers: options.workers.max(1),
        })
    }

    pub fn with_entities(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.enricher = self.enricher.with_entities(recognizer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn process_file(&self, path: &Path) -> Result<ProcessedFile, IngestError> {
        let started = Instant::now();
        let filename = relative_filename(&self.root, path)?;
        let facts = FileFacts::read(path)?;
        let pages = extract_file(path)?;

        let document = DocumentContext {
            filename: filename.clone(),
            total_pages: pages.len() as u32,
            facts,
        };

        let mut chunks = Vec::new();
        let mut records = Vec::new();
        let mut next_chunk: HashMap<PageId, u32> = HashMap::new();

        for page in &pages {
            for (index_in_page, text) in self.chunker.chunk(&page.text).into_iter().enumerate() {
                let counter = next_chunk.entry(page.page.clone()).or_default();
                let slot = ChunkSlot {
                    text: &text,
                    chunk: *counter,
                    index_in_page,
                };
                *counter += 1;
                records.push(self.enricher.enrich(&document, page, slot));
                chunks.push(text);
            }
        }

        if chunks.is_empty() {
            return Err(IngestError::EmptyDocument(filename));
        }

        debug!(
            file = %filename,
            pages = pages.len(),
            chunks = chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed file"
        );
        Ok(ProcessedFile {
            filename,
            chunks,
            records,
        })
    }

    fn outcome(&self, path: &Path) -> FileOutcome {
        FileOutcome {
            path: path.to_path_buf(),
            result: self.process_file(path),
        }
    }

    /// Starts the pool on a blocking thread and streams one outcome per file.
    pub fn spawn(self: Arc<Self>, files: Vec<PathBuf>) -> mpsc::UnboundedReceiver<FileOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .build();
            match pool {
                Ok(pool) => pool.install(|| {
                    files.par_iter().for_each_with(tx, |tx, path| {
                        // The receiver only goes away when the run is abandoned.
                        let _ = tx.send(self.outcome(path));
                    });
                }),
                Err(error) => {
                    warn!(error = %error, "worker pool unavailable, processing sequentially");
                    for path in &files {
                        if tx.send(self.outcome(path)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        rx
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestionReport {
    pub files_found: usize,
    pub processed: usize,
    pub failed: Vec<SkippedFile>,
    pub total_chunks: usize,
}

impl IngestionReport {
    pub fn success_rate(&self) -> f64 {
        if self.files_found == 0 {
            return 0.0;
        }
        self.processed as f64 / self.files_found as f64 * 100.0
    }

    fn log(&self) {
        info!(
            files_found = self.files_found,
            processed = self.processed,
            failed = self.failed.len(),
            total_chunks = self.total_chunks,
            success_rate = self.success_rate(),
            "ingestion finished"
        );
        for skipped in &self.failed {
            warn!(file = %skipped.path.display(), reason = %skipped.reason, "file not indexed");
        }
    }
}

/// Full rebuild: discover, reset both indexes, index every file, build the lexical blob.
///
/// Per-file extraction and storage failures are recorded in the report. A
/// failure to reset or finalize the indexes aborts the run.
pub async fn run_ingestion<V, E>(
    orchestrator: Arc<ExtractionOrchestrator>,
    builder: &IndexBuilder<V, E>,
) -> Result<IngestionReport, IngestError>
where
    V: VectorStore + ?Sized,
    E: Embedder + ?Sized,
{
    let started = Instant::now();
    let files = discover_documents(orchestrator.root())?;
    info!(
        files = files.len(),
        workers = orchestrator.workers(),
        root = %orchestrator.root().display(),
        "starting ingestion"
    );

    builder.reset().await?;

    let mut report = IngestionReport {
        files_found: files.len(),
        ..IngestionReport::default()
    };
    if files.is_empty() {
        warn!("no supported documents found; indexes left empty");
        report.log();
        return Ok(report);
    }

    let mut outcomes = orchestrator.spawn(files);
    while let Some(outcome) = outcomes.recv().await {
        let processed = match outcome.result {
            Ok(processed) => processed,
            Err(reason) => {
                warn!(file = %outcome.path.display(), reason = %reason, "extraction failed");
                report.failed.push(SkippedFile {
                    path: outcome.path,
                    reason: reason.to_string(),
                });
                continue;
            }
        };

        match builder.store_file(&processed).await {
            Ok(stored) => {
                report.processed += 1;
                report.total_chunks += stored;
                info!(file = %processed.filename, chunks = stored, "indexed");
            }
            Err(reason) => {
                error!(file = %processed.filename, reason = %reason, "storing chunks failed");
                report.failed.push(SkippedFile {
                    path: outcome.path,
                    reason: reason.to_string(),
                });
            }
        }
    }

    if report.total_chunks > 0 {
        builder.finalize().await?;
    }

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "rebuild complete");
    report.log();
    Ok(report)
}
