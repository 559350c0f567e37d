use crate::embeddings::PASSAGE_PREFIX;
use crate::ingest::ProcessedFile;
use crate::lexical::LexicalIndex;
use crate::models::IndexOptions;
use crate::store::VectorRecord;
use crate::traits::{Embedder, VectorStore};
use crate::SearchError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Writes extraction output into the vector store and the lexical blob.
///
/// A rebuild is `reset`, then `store_file` for every processed file, then
/// `finalize` once, which derives the lexical index from whatever the vector
/// store holds at that point.
pub struct IndexBuilder<V: ?Sized, E: ?Sized> {
    store: Arc<V>,
    embedder: Arc<E>,
    lexical_path: PathBuf,
    options: IndexOptions,
}

impl<V, E> IndexBuilder<V, E>
where
    V: VectorStore + ?Sized,
    E: Embedder + ?Sized,
{
    pub fn new(store: Arc<V>, embedder: Arc<E>, lexical_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            embedder,
            lexical_path: lexical_path.into(),
            options: IndexOptions::default(),
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lexical_path(&self) -> &Path {
        &self.lexical_path
    }

    /// Drops both indexes and recreates an empty collection.
    ///
    /// Nothing is staged: if the run fails after this point the indexes stay
    /// empty until the next successful rebuild.
    pub async fn reset(&self) -> Result<(), SearchError> {
        self.store.delete_collection().await?;
        LexicalIndex::remove(&self.lexical_path).await?;
        self.store
            .ensure_collection(self.embedder.dimensions())
            .await?;
        info!(lexical = %self.lexical_path.display(), "cleared vector collection and lexical index");
        Ok(())
    }

    /// Embeds and writes one file's chunks, returning how many were stored.
    pub async fn store_file(&self, file: &ProcessedFile) -> Result<usize, SearchError> {
        if file.chunks.len() != file.records.len() {
            return Err(SearchError::Request(format!(
                "{} chunks but {} records for {}",
                file.chunks.len(),
                file.records.len(),
                file.filename
            )));
        }

        let passages = file
            .chunks
            .iter()
            .map(|chunk| {
                let truncated: String = chunk.chars().take(self.options.passage_max_chars).collect();
                format!("{PASSAGE_PREFIX}{truncated}")
            })
            .collect::<Vec<_>>();

        let mut embeddings = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.options.embed_batch_size.max(1)) {
            embeddings.extend(self.embedder.embed_batch(batch).await?);
        }
        if embeddings.len() != file.chunks.len() {
            return Err(SearchError::BackendResponse {
                backend: "embedder".to_string(),
                details: format!(
                    "{} embeddings for {} chunks",
                    embeddings.len(),
                    file.chunks.len()
                ),
            });
        }

        let records = file
            .chunks
            .iter()
            .zip(&file.records)
            .zip(embeddings)
            .map(|((text, metadata), embedding)| VectorRecord {
                id: metadata.record_id(),
                text: text.clone(),
                embedding,
                metadata: metadata.clone(),
            })
            .collect::<Vec<_>>();

        for batch in records.chunks(self.options.write_batch_size.max(1)) {
            if let Err(write_error) = self.store.add(batch).await {
                self.roll_back(&file.filename, &records).await;
                return Err(write_error);
            }
        }

        debug!(file = %file.filename, chunks = records.len(), "stored chunks");
        Ok(records.len())
    }

    /// Removes every record of a partially written file so neither index sees it.
    async fn roll_back(&self, filename: &str, records: &[VectorRecord]) {
        let ids = records.iter().map(|record| record.id.clone()).collect::<Vec<_>>();
        match self.store.remove(&ids).await {
            Ok(()) => warn!(file = %filename, chunks = ids.len(), "rolled back partial write"),
            Err(error) => error!(
                file = %filename,
                error = %error,
                "rollback failed, partial chunks remain in the vector store"
            ),
        }
    }

    /// Builds the lexical blob over the full stored chunk set.
    pub async fn finalize(&self) -> Result<usize, SearchError> {
        let stored = self.store.get_all().await?;
        let (chunks, metadatas): (Vec<_>, Vec<_>) = stored
            .into_iter()
            .map(|chunk| (chunk.text, chunk.metadata))
            .unzip();

        let index = LexicalIndex::build(chunks, metadatas);
        index.save(&self.lexical_path).await?;
        info!(
            chunks = index.len(),
            lexical = %self.lexical_path.display(),
            "lexical index written"
        );
        Ok(index.len())
    }
}
