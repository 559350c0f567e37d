use crate::embeddings::QUERY_PREFIX;
use crate::lexical::{LexicalHit, LexicalIndex};
use crate::models::{
    ChunkRecord, DocumentSummary, LibrarySummary, ListDocumentsResult, RetrievalOptions,
    SearchDocumentsResult, SearchResult,
};
use crate::store::VectorHit;
use crate::traits::{Embedder, Reranker, VectorStore};
use crate::SearchError;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Semantic hits scored as `(1 - distance) * weight`.
pub fn semantic_results(hits: Vec<VectorHit>, semantic_weight: f64) -> Vec<SearchResult> {
    hits.into_iter()
        .map(|hit| SearchResult {
            text: hit.text,
            metadata: hit.metadata,
            score: (1.0 - hit.distance) * semantic_weight,
            rerank_score: None,
        })
        .collect()
}

/// Lexical hits normalized by the best score in the set, times `1 - weight`.
pub fn lexical_results(
    index: &LexicalIndex,
    hits: &[LexicalHit],
    semantic_weight: f64,
) -> Vec<SearchResult> {
    let max_score = hits
        .iter()
        .map(|hit| hit.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let max_score = if max_score > 0.0 { max_score } else { 1.0 };

    hits.iter()
        .filter(|hit| hit.score > 0.0)
        .filter_map(|hit| {
            let text = index.chunks.get(hit.index)?;
            let metadata = index.metadatas.get(hit.index)?;
            Some(SearchResult {
                text: text.clone(),
                metadata: metadata.clone(),
                score: hit.score / max_score * (1.0 - semantic_weight),
                rerank_score: None,
            })
        })
        .collect()
}

/// Sorts by score, best first, and keeps the first result per text prefix.
pub fn dedupe_by_prefix(mut results: Vec<SearchResult>, prefix_chars: usize) -> Vec<SearchResult> {
    results.sort_by(|left, right| right.score.total_cmp(&left.score));

    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|result| seen.insert(result.text.chars().take(prefix_chars).collect::<String>()))
        .collect()
}

/// Number of leading candidates handed to the reranker.
pub fn rerank_window(top_k: usize, floor: usize) -> usize {
    (top_k * 3 / 2).max(floor)
}

#[derive(Debug, Clone, PartialEq)]
struct LexicalStamp {
    modified: Option<SystemTime>,
    len: u64,
}

struct LexicalCache {
    stamp: Option<LexicalStamp>,
    index: Arc<LexicalIndex>,
}

/// Two-channel retrieval with prefix dedupe and optional cross-encoder reranking.
///
/// The lexical blob is read on first use and re-read whenever the file on
/// disk changes, so a finished rebuild is picked up without a restart.
pub struct HybridRetriever<V: ?Sized, E: ?Sized> {
    store: Arc<V>,
    embedder: Arc<E>,
    reranker: Option<Arc<dyn Reranker>>,
    lexical_path: PathBuf,
    lexical: Mutex<Option<LexicalCache>>,
    options: RetrievalOptions,
}

impl<V, E> HybridRetriever<V, E>
where
    V: VectorStore + ?Sized,
    E: Embedder + ?Sized,
{
    pub fn new(store: Arc<V>, embedder: Arc<E>, lexical_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
            lexical_path: lexical_path.into(),
            lexical: Mutex::new(None),
            options: RetrievalOptions::default(),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_options(mut self, options: RetrievalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    async fn lexical_stamp(path: &Path) -> Result<Option<LexicalStamp>, SearchError> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(LexicalStamp {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn lexical_index(&self) -> Result<Arc<LexicalIndex>, SearchError> {
        let stamp = Self::lexical_stamp(&self.lexical_path).await?;
        let mut cache = self.lexical.lock().await;
        if let Some(cached) = cache.as_ref().filter(|cached| cached.stamp == stamp) {
            return Ok(Arc::clone(&cached.index));
        }

        let index = match stamp {
            Some(_) => Arc::new(LexicalIndex::load(&self.lexical_path).await?),
            None => Arc::new(LexicalIndex::default()),
        };
        info!(chunks = index.len(), path = %self.lexical_path.display(), "lexical index loaded");
        *cache = Some(LexicalCache {
            stamp,
            index: Arc::clone(&index),
        });
        Ok(index)
    }

    async fn semantic_channel(
        &self,
        query: &str,
        fetch: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if !self.options.enable_semantic {
            return Ok(Vec::new());
        }

        let embedded = self
            .embedder
            .embed_batch(&[format!("{QUERY_PREFIX}{query}")])
            .await?;
        let Some(vector) = embedded.into_iter().next() else {
            return Err(SearchError::BackendResponse {
                backend: "embedder".to_string(),
                details: "no vector for query".to_string(),
            });
        };

        let hits = self.store.query(&vector, fetch).await?;
        Ok(semantic_results(hits, self.options.semantic_weight))
    }

    async fn lexical_channel(
        &self,
        query: &str,
        fetch: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if !self.options.enable_lexical {
            return Ok(Vec::new());
        }

        let index = self.lexical_index().await?;
        let hits = index.search(query, fetch);
        Ok(lexical_results(&index, &hits, self.options.semantic_weight))
    }

    /// Reranks the leading window when there are more than `top_k` candidates.
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<SearchResult>,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if candidates.len() <= top_k {
            return Ok(candidates);
        }

        candidates.truncate(rerank_window(top_k, self.options.rerank_floor));
        if let Some(reranker) = &self.reranker {
            let passages = candidates
                .iter()
                .map(|candidate| {
                    candidate
                        .text
                        .chars()
                        .take(self.options.rerank_max_chars)
                        .collect::<String>()
                })
                .collect::<Vec<_>>();
            let scores = reranker.score(query, &passages).await?;
            if scores.len() != candidates.len() {
                return Err(SearchError::BackendResponse {
                    backend: "reranker".to_string(),
                    details: format!("{} scores for {} passages", scores.len(), candidates.len()),
                });
            }

            for (candidate, score) in candidates.iter_mut().zip(scores) {
                candidate.rerank_score = Some(f64::from(score));
            }
            candidates.sort_by(|left, right| {
                let left = left.rerank_score.unwrap_or(f64::NEG_INFINITY);
                let right = right.rerank_score.unwrap_or(f64::NEG_INFINITY);
                right.total_cmp(&left)
            });
        }

        candidates.truncate(top_k);
        Ok(candidates)
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, SearchError> {
        let top_k = top_k.max(1);
        let fetch = top_k * 2;

        let (semantic, lexical) = tokio::try_join!(
            self.semantic_channel(query, fetch),
            self.lexical_channel(query, fetch)
        )?;
        debug!(semantic = semantic.len(), lexical = lexical.len(), "channel results");

        let mut fused = semantic;
        fused.extend(lexical);
        let candidates = dedupe_by_prefix(fused, self.options.dedupe_prefix_chars);

        self.rerank(query, candidates, top_k).await
    }

    /// Validated search whose failures are reported in the `error` field.
    pub async fn search_documents(&self, query: &str, max_results: i64) -> SearchDocumentsResult {
        let query = query.trim();
        if query.is_empty() {
            return SearchDocumentsResult {
                error: Some("Query is required".to_string()),
                ..SearchDocumentsResult::default()
            };
        }

        let limit = max_results.clamp(1, self.options.max_results.max(1) as i64) as usize;
        match self.search(query, limit).await {
            Ok(results) => SearchDocumentsResult {
                total_found: results.len(),
                results,
                query: query.to_string(),
                error: None,
            },
            Err(error) => SearchDocumentsResult {
                query: query.to_string(),
                error: Some(error.to_string()),
                ..SearchDocumentsResult::default()
            },
        }
    }

    pub async fn list_documents(&self) -> ListDocumentsResult {
        match self.store.get_all().await {
            Ok(stored) => summarize_documents(stored.into_iter().map(|chunk| chunk.metadata)),
            Err(error) => ListDocumentsResult {
                error: Some(error.to_string()),
                ..ListDocumentsResult::default()
            },
        }
    }
}

/// Per-filename aggregation of stored chunk metadata, sorted by filename.
pub fn summarize_documents(
    records: impl IntoIterator<Item = ChunkRecord>,
) -> ListDocumentsResult {
    struct Aggregate {
        summary: DocumentSummary,
        pages: BTreeSet<String>,
        sheet_titles: BTreeSet<String>,
    }

    let mut documents: BTreeMap<String, Aggregate> = BTreeMap::new();
    for record in records {
        let entry = documents
            .entry(record.filename.clone())
            .or_insert_with(|| Aggregate {
                summary: DocumentSummary {
                    filename: record.filename.clone(),
                    total_pages: record.total_pages,
                    indexed_pages: 0,
                    chunks: 0,
                    language: record.language,
                    created_at: record.created_at.clone(),
                    modified_at: record.modified_at.clone(),
                    sheet_titles: Vec::new(),
                    file_type: record.file_type.clone(),
                },
                pages: BTreeSet::new(),
                sheet_titles: BTreeSet::new(),
            });

        entry.summary.chunks += 1;
        entry.pages.insert(record.page.to_string());
        if let Some(title) = record.sheet_title {
            entry.sheet_titles.insert(title);
        }
    }

    let mut summary = LibrarySummary::default();
    let documents = documents
        .into_values()
        .map(|aggregate| {
            let mut document = aggregate.summary;
            document.indexed_pages = aggregate.pages.len();
            document.sheet_titles = aggregate.sheet_titles.into_iter().collect();
            summary.total_documents += 1;
            summary.total_chunks += document.chunks;
            summary.total_pages += u64::from(document.total_pages);
            document
        })
        .collect();

    ListDocumentsResult {
        documents,
        summary,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{Language, PageId};
    use crate::store::{StoredChunk, VectorRecord};
    use crate::stores::InMemoryVectorStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn record(filename: &str, page: PageId, chunk: u32) -> ChunkRecord {
        ChunkRecord {
            filename: filename.to_string(),
            page,
            chunk,
            total_pages: 3,
            language: Language::En,
            patterns: BTreeMap::new(),
            sheet_title: None,
            total_cells: None,
            file_type: "pdf".to_string(),
            file_size: 100,
            created_at: Some("2024-01-01T00:00:00+00:00".to_string()),
            modified_at: None,
            persons: None,
            orgs: None,
        }
    }

    fn result(text: &str, score: f64) -> SearchResult {
        SearchResult {
            text: text.to_string(),
            metadata: record("a.pdf", PageId::Number(1), 0),
            score,
            rerank_score: None,
        }
    }

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[derive(Default)]
    struct FixedVectorStore {
        hits: Vec<VectorHit>,
        fail: bool,
    }

    #[async_trait]
    impl VectorStore for FixedVectorStore {
        async fn delete_collection(&self) -> Result<(), SearchError> {
            Ok(())
        }

        async fn ensure_collection(&self, _dimensions: usize) -> Result<(), SearchError> {
            Ok(())
        }

        async fn add(&self, _records: &[VectorRecord]) -> Result<(), SearchError> {
            Ok(())
        }

        async fn remove(&self, _ids: &[String]) -> Result<(), SearchError> {
            Ok(())
        }

        async fn query(&self, _embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>, SearchError> {
            if self.fail {
                return Err(SearchError::Request("vector store unreachable".to_string()));
            }
            Ok(self.hits.iter().take(limit).cloned().collect())
        }

        async fn get_all(&self) -> Result<Vec<StoredChunk>, SearchError> {
            Ok(Vec::new())
        }
    }

    struct CountingReranker {
        calls: AtomicUsize,
        passages: AtomicUsize,
    }

    impl CountingReranker {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                passages: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Reranker for CountingReranker {
        /// Later passages score higher, so reordering is visible.
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.passages.store(passages.len(), Ordering::SeqCst);
            Ok((0..passages.len()).map(|index| index as f32).collect())
        }
    }

    fn hit(text: &str, distance: f64) -> VectorHit {
        VectorHit {
            text: text.to_string(),
            metadata: record("a.pdf", PageId::Number(1), 0),
            distance,
        }
    }

    #[test]
    fn fused_scores_follow_channel_weights() {
        let semantic = semantic_results(vec![hit("pump curve", 0.2), hit("valve list", 0.6)], 0.7);
        let index = LexicalIndex::build(
            vec!["seal kit".to_string(), "pump seal".to_string()],
            vec![
                record("b.pdf", PageId::Number(1), 0),
                record("b.pdf", PageId::Number(1), 1),
            ],
        );
        let lexical = lexical_results(
            &index,
            &[
                LexicalHit {
                    index: 1,
                    score: 4.0,
                },
                LexicalHit {
                    index: 0,
                    score: 2.0,
                },
            ],
            0.7,
        );

        assert!(close(semantic[0].score, 0.8 * 0.7));
        assert!(close(semantic[1].score, 0.4 * 0.7));
        assert!(close(lexical[0].score, 0.3));
        assert!(close(lexical[1].score, 0.15));

        let mut fused = semantic;
        fused.extend(lexical);
        let ordered = dedupe_by_prefix(fused, 100);
        let texts = ordered.iter().map(|r| r.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["pump curve", "pump seal", "valve list", "seal kit"]);
        assert!(ordered.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn duplicate_prefix_keeps_higher_score() {
        let prefix = "x".repeat(100);
        let low = result(&format!("{prefix} low tail"), 0.4);
        let high = result(&format!("{prefix} different high tail"), 0.6);
        let other = result("unrelated", 0.5);

        let kept = dedupe_by_prefix(vec![low, other, high], 100);

        assert_eq!(kept.len(), 2);
        assert!(close(kept[0].score, 0.6));
        assert!(kept[0].text.ends_with("high tail"));
        assert_eq!(kept[1].text, "unrelated");
    }

    #[test]
    fn equal_scores_keep_input_order() {
        let kept = dedupe_by_prefix(
            vec![result("first", 0.5), result("second", 0.5), result("third", 0.5)],
            100,
        );
        let texts = kept.iter().map(|r| r.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn rerank_is_skipped_when_candidates_fit() -> Result<(), SearchError> {
        let reranker = Arc::new(CountingReranker::new());
        let retriever = HybridRetriever::new(
            Arc::new(FixedVectorStore::default()),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            "unused.json",
        )
        .with_reranker(reranker.clone());
        let candidates = (0..4)
            .map(|n| result(&format!("candidate {n}"), 1.0 - f64::from(n) * 0.1))
            .collect::<Vec<_>>();

        let ranked = retriever.rerank("pump", candidates.clone(), 5).await?;

        assert_eq!(ranked, candidates);
        assert_eq!(reranker.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rerank_only_sees_the_leading_window() -> Result<(), SearchError> {
        let reranker = Arc::new(CountingReranker::new());
        let retriever = HybridRetriever::new(
            Arc::new(FixedVectorStore::default()),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            "unused.json",
        )
        .with_reranker(reranker.clone());
        let candidates = (0..30)
            .map(|n| result(&format!("candidate {n}"), 1.0 - f64::from(n) * 0.01))
            .collect::<Vec<_>>();

        let ranked = retriever.rerank("pump", candidates, 5).await?;

        assert_eq!(rerank_window(5, 25), 25);
        assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reranker.passages.load(Ordering::SeqCst), 25);
        assert_eq!(ranked.len(), 5);
        assert_eq!(ranked[0].text, "candidate 24");
        assert_eq!(ranked[0].rerank_score, Some(24.0));
        Ok(())
    }

    #[tokio::test]
    async fn without_reranker_overflow_is_truncated() -> Result<(), SearchError> {
        let retriever = HybridRetriever::new(
            Arc::new(FixedVectorStore::default()),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            "unused.json",
        );
        let candidates = (0..12)
            .map(|n| result(&format!("candidate {n}"), 1.0 - f64::from(n) * 0.01))
            .collect::<Vec<_>>();

        let ranked = retriever.rerank("pump", candidates, 3).await?;

        let texts = ranked.iter().map(|r| r.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["candidate 0", "candidate 1", "candidate 2"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_lexical_blob_leaves_semantic_results() -> Result<(), SearchError> {
        let dir = tempdir()?;
        let store = FixedVectorStore {
            hits: vec![hit("pump curve", 0.1), hit("valve list", 0.5)],
            fail: false,
        };
        let retriever = HybridRetriever::new(
            Arc::new(store),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            dir.path().join("absent.json"),
        );

        let results = retriever.search("pump", 5).await?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "pump curve");
        Ok(())
    }

    #[tokio::test]
    async fn lexical_blob_is_reloaded_after_rebuild() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("lexical.json");
        let retriever = HybridRetriever::new(
            Arc::new(FixedVectorStore::default()),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            &path,
        );
        let corpus = |texts: &[&str]| {
            LexicalIndex::build(
                texts.iter().map(|text| text.to_string()).collect(),
                (0..texts.len() as u32)
                    .map(|chunk| record("a.pdf", PageId::Number(1), chunk))
                    .collect(),
            )
        };

        assert!(retriever.search("gasket", 5).await?.is_empty());

        corpus(&["gasket torque table", "other", "more", "filler"]).save(&path).await?;
        let first = retriever.search("gasket", 5).await?;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].text, "gasket torque table");

        corpus(&["replacement gasket procedure for pumps", "other", "more", "filler"])
            .save(&path)
            .await?;
        let second = retriever.search("gasket", 5).await?;
        assert_eq!(second[0].text, "replacement gasket procedure for pumps");
        Ok(())
    }

    #[tokio::test]
    async fn search_documents_validates_and_reports_errors() {
        let failing = HybridRetriever::new(
            Arc::new(FixedVectorStore {
                hits: Vec::new(),
                fail: true,
            }),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            "unused.json",
        );

        let blank = failing.search_documents("   ", 5).await;
        assert_eq!(blank.error.as_deref(), Some("Query is required"));
        assert!(blank.results.is_empty());

        let failed = failing.search_documents("pump", 5).await;
        assert_eq!(failed.query, "pump");
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|error| error.contains("vector store unreachable")));
    }

    #[tokio::test]
    async fn search_documents_clamps_result_count() {
        let hits = (0..60)
            .map(|n| hit(&format!("distinct chunk {n}"), f64::from(n) * 0.01))
            .collect();
        let retriever = HybridRetriever::new(
            Arc::new(FixedVectorStore { hits, fail: false }),
            Arc::new(CharacterNgramEmbedder { dimensions: 8 }),
            "unused.json",
        );

        let many = retriever.search_documents("chunk", 500).await;
        assert_eq!(many.total_found, 25);
        let none = retriever.search_documents("chunk", 0).await;
        assert_eq!(none.total_found, 1);
        assert!(none.error.is_none());
    }

    #[tokio::test]
    async fn list_documents_aggregates_per_file() -> Result<(), SearchError> {
        let store = Arc::new(InMemoryVectorStore::new());
        store.ensure_collection(2).await?;
        let mut sheet = record("plan.xlsx", PageId::Name("Q2".to_string()), 0);
        sheet.sheet_title = Some("Q2".to_string());
        sheet.file_type = "xlsx".to_string();
        let mut other_sheet = record("plan.xlsx", PageId::Name("Q1".to_string()), 0);
        other_sheet.sheet_title = Some("Q1".to_string());
        other_sheet.file_type = "xlsx".to_string();
        let records = vec![
            record("b.pdf", PageId::Number(1), 0),
            record("b.pdf", PageId::Number(1), 1),
            record("b.pdf", PageId::Number(2), 0),
            sheet,
            other_sheet,
        ];
        store
            .add(
                &records
                    .into_iter()
                    .map(|metadata| VectorRecord {
                        id: metadata.record_id(),
                        text: "text".to_string(),
                        embedding: vec![1.0, 0.0],
                        metadata,
                    })
                    .collect::<Vec<_>>(),
            )
            .await?;
        let retriever = HybridRetriever::new(
            store,
            Arc::new(CharacterNgramEmbedder { dimensions: 2 }),
            "unused.json",
        );

        let listed = retriever.list_documents().await;

        assert!(listed.error.is_none());
        assert_eq!(listed.documents.len(), 2);
        let pdf = &listed.documents[0];
        assert_eq!(pdf.filename, "b.pdf");
        assert_eq!(pdf.chunks, 3);
        assert_eq!(pdf.indexed_pages, 2);
        let workbook = &listed.documents[1];
        assert_eq!(workbook.sheet_titles, vec!["Q1", "Q2"]);
        assert_eq!(workbook.file_type, "xlsx");
        assert_eq!(
            listed.summary,
            LibrarySummary {
                total_documents: 2,
                total_chunks: 5,
                total_pages: 6,
            }
        );
        Ok(())
    }
}
