//! Term-frequency index persisted as one JSON blob next to the vector store.

use crate::models::ChunkRecord;
use crate::SearchError;
use bm25::{Document, SearchEngine, SearchEngineBuilder, Tokenizer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

/// Lower-cased runs of word characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Case folding only: no stemming and no stop words, so exact codes still match.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        tokenize(input_text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub index: usize,
    pub score: f64,
}

/// On-disk form: only the corpus is stored, the scorer is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct LexicalBlob {
    chunks: Vec<String>,
    metadatas: Vec<ChunkRecord>,
}

/// BM25 over stored chunk texts, keyed by position in `chunks`.
pub struct LexicalIndex {
    engine: SearchEngine<usize, u32, WordTokenizer>,
    pub chunks: Vec<String>,
    pub metadatas: Vec<ChunkRecord>,
}

impl fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LexicalIndex")
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::build(Vec::new(), Vec::new())
    }
}

impl LexicalIndex {
    pub fn build(chunks: Vec<String>, metadatas: Vec<ChunkRecord>) -> Self {
        let documents = chunks
            .iter()
            .enumerate()
            .map(|(id, text)| Document {
                id,
                contents: text.clone(),
            })
            .collect::<Vec<_>>();
        let engine = SearchEngineBuilder::<usize, u32, WordTokenizer>::with_tokenizer_and_documents(
            WordTokenizer,
            documents,
        )
        .build();

        Self {
            engine,
            chunks,
            metadatas,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Highest-scoring chunks with a positive score, best first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<LexicalHit> {
        if tokenize(query).is_empty() || self.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut hits = self
            .engine
            .search(query, limit)
            .into_iter()
            .filter(|result| result.score > 0.0 && result.document.id < self.chunks.len())
            .map(|result| LexicalHit {
                index: result.document.id,
                score: f64::from(result.score),
            })
            .collect::<Vec<_>>();
        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.index.cmp(&right.index))
        });
        hits.truncate(limit);
        hits
    }

    /// Writes the blob to a sibling temp file and renames it into place.
    pub async fn save(&self, path: &Path) -> Result<(), SearchError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let blob = LexicalBlob {
            chunks: self.chunks.clone(),
            metadatas: self.metadatas.clone(),
        };
        let bytes = serde_json::to_vec(&blob)?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// A missing file reads as an empty index.
    pub async fn load(path: &Path) -> Result<Self, SearchError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let blob: LexicalBlob = serde_json::from_slice(&bytes)?;
                if blob.chunks.len() != blob.metadatas.len() {
                    return Err(SearchError::BackendResponse {
                        backend: "lexical index".to_string(),
                        details: format!(
                            "{} chunks but {} metadatas in {}",
                            blob.chunks.len(),
                            blob.metadatas.len(),
                            path.display()
                        ),
                    });
                }
                Ok(Self::build(blob.chunks, blob.metadatas))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn remove(path: &Path) -> Result<(), SearchError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Language, PageId};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(filename: &str, chunk: u32) -> ChunkRecord {
        ChunkRecord {
            filename: filename.to_string(),
            page: PageId::Number(1),
            chunk,
            total_pages: 1,
            language: Language::En,
            patterns: BTreeMap::new(),
            sheet_title: None,
            total_cells: None,
            file_type: "pdf".to_string(),
            file_size: 1,
            created_at: None,
            modified_at: None,
            persons: None,
            orgs: None,
        }
    }

    fn sample() -> LexicalIndex {
        LexicalIndex::build(
            vec![
                "Hydraulic pump maintenance procedure".to_string(),
                "Electrical panel lockout".to_string(),
                "Hydraulic pump pump seal".to_string(),
                "Quarterly budget review".to_string(),
                "Fire extinguisher inspection".to_string(),
                "Warehouse inventory count".to_string(),
            ],
            (0..6).map(|chunk| record("a.pdf", chunk)).collect(),
        )
    }

    #[test]
    fn tokenizer_folds_case_and_drops_punctuation() {
        assert_eq!(
            tokenize("Pump-Seal, REG_12 إجراء!"),
            vec!["pump", "seal", "reg_12", "إجراء"]
        );
    }

    #[test]
    fn search_ranks_term_frequency_and_skips_zero_scores() {
        let hits = sample().search("hydraulic PUMP", 10);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 2);
        assert_eq!(hits[1].index, 0);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn terms_match_exactly_without_stemming() {
        let index = LexicalIndex::build(
            vec![
                "Inspection procedures for SOP 12".to_string(),
                "Procedure for valve isolation".to_string(),
                "Budget notes".to_string(),
            ],
            (0..3).map(|chunk| record("a.pdf", chunk)).collect(),
        );

        let hits = index.search("procedure", 10);
        assert_eq!(hits.iter().map(|hit| hit.index).collect::<Vec<_>>(), vec![1]);
        assert_eq!(index.search("sop", 10).len(), 1);
    }

    #[test]
    fn search_respects_limit_and_empty_queries() {
        let index = sample();
        assert_eq!(index.search("pump", 1).len(), 1);
        assert!(index.search("!!!", 5).is_empty());
        assert!(LexicalIndex::default().search("pump", 5).is_empty());
    }

    #[tokio::test]
    async fn blob_round_trips_and_missing_file_is_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index").join("lexical.json");

        assert!(LexicalIndex::load(&path).await?.is_empty());

        sample().save(&path).await?;
        let loaded = LexicalIndex::load(&path).await?;
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.metadatas[2].record_id(), "a.pdf_1_2");
        assert_eq!(loaded.search("hydraulic pump", 10), sample().search("hydraulic pump", 10));

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        let mut keys = raw
            .as_object()
            .map(|object| object.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        keys.sort();
        assert_eq!(keys, vec!["chunks", "metadatas"]);

        LexicalIndex::remove(&path).await?;
        LexicalIndex::remove(&path).await?;
        assert!(!path.exists());
        Ok(())
    }
}
