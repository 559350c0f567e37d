use anyhow::Context;
use clap::Args;
use office_search_core::{
    CharacterNgramEmbedder, Embedder, ExtractionOrchestrator, HttpEmbedder, HttpEntityRecognizer,
    HttpReranker, HybridRetriever, IndexBuilder, IngestionOptions, QdrantStore, RetrievalOptions,
    VectorStore, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::PathBuf;
use std::sync::Arc;

pub type Retriever = HybridRetriever<dyn VectorStore, dyn Embedder>;
pub type Builder = IndexBuilder<QdrantStore, dyn Embedder>;

/// Options shared by every subcommand, forwarded verbatim to a spawned `ingest`.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Root folder scanned recursively for documents.
    #[arg(long, env = "DOCS_ROOT", default_value = "docs")]
    pub docs_root: PathBuf,

    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    pub qdrant_url: String,

    #[arg(long, env = "VECTOR_DB_COLLECTION_NAME", default_value = "documents")]
    pub collection: String,

    /// Location of the serialized lexical index.
    #[arg(long, env = "LEXICAL_INDEX_PATH", default_value = "index/lexical_index.json")]
    pub lexical_index: PathBuf,

    /// Embedding service; the deterministic n-gram embedder is used when unset.
    #[arg(long, env = "EMBEDDER_URL")]
    pub embedder_url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    pub embedding_dimensions: usize,

    /// Cross-encoder service; without it results are truncated instead of re-ranked.
    #[arg(long, env = "RERANKER_URL")]
    pub reranker_url: Option<String>,

    /// Entity-recognition service for person/organization metadata.
    #[arg(long, env = "NER_URL")]
    pub ner_url: Option<String>,

    #[arg(long, default_value_t = 800)]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 100)]
    pub chunk_overlap: usize,

    /// Extraction workers; defaults to available parallelism minus one, capped at 8.
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long, default_value_t = 0.7)]
    pub semantic_weight: f64,
}

impl GlobalArgs {
    pub fn embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        let embedder: Arc<dyn Embedder> = match &self.embedder_url {
            Some(url) => Arc::new(
                HttpEmbedder::new(url, self.embedding_dimensions)
                    .with_context(|| format!("invalid embedder url {url}"))?,
            ),
            None => Arc::new(CharacterNgramEmbedder {
                dimensions: self.embedding_dimensions,
            }),
        };
        Ok(embedder)
    }

    pub fn store(&self) -> anyhow::Result<Arc<QdrantStore>> {
        let store = QdrantStore::new(&self.qdrant_url, self.collection.clone())
            .with_context(|| format!("invalid qdrant url {}", self.qdrant_url))?;
        Ok(Arc::new(store))
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        let defaults = IngestionOptions::default();
        IngestionOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            workers: self.workers.unwrap_or(defaults.workers),
            ..defaults
        }
    }

    pub fn orchestrator(&self) -> anyhow::Result<ExtractionOrchestrator> {
        let mut orchestrator =
            ExtractionOrchestrator::new(&self.docs_root, &self.ingestion_options())
                .context("invalid ingestion options")?;
        if let Some(url) = &self.ner_url {
            let recognizer = HttpEntityRecognizer::new(url)
                .with_context(|| format!("invalid ner url {url}"))?;
            orchestrator = orchestrator.with_entities(Arc::new(recognizer));
        }
        Ok(orchestrator)
    }

    pub fn index_builder(&self) -> anyhow::Result<Builder> {
        Ok(IndexBuilder::new(
            self.store()?,
            self.embedder()?,
            &self.lexical_index,
        ))
    }

    pub fn retriever(&self) -> anyhow::Result<Retriever> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.semantic_weight),
            "--semantic-weight must be within [0, 1], got {}",
            self.semantic_weight
        );
        let store: Arc<dyn VectorStore> = self.store()?;
        let mut retriever = HybridRetriever::new(store, self.embedder()?, &self.lexical_index)
            .with_options(RetrievalOptions {
                semantic_weight: self.semantic_weight,
                ..RetrievalOptions::default()
            });
        if let Some(url) = &self.reranker_url {
            let reranker =
                HttpReranker::new(url).with_context(|| format!("invalid reranker url {url}"))?;
            retriever = retriever.with_reranker(Arc::new(reranker));
        }
        Ok(retriever)
    }

    /// Command-line form of these options, placed before the subcommand name.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--docs-root".to_string(),
            self.docs_root.display().to_string(),
            "--qdrant-url".to_string(),
            self.qdrant_url.clone(),
            "--collection".to_string(),
            self.collection.clone(),
            "--lexical-index".to_string(),
            self.lexical_index.display().to_string(),
            "--embedding-dimensions".to_string(),
            self.embedding_dimensions.to_string(),
            "--chunk-size".to_string(),
            self.chunk_size.to_string(),
            "--chunk-overlap".to_string(),
            self.chunk_overlap.to_string(),
            "--semantic-weight".to_string(),
            self.semantic_weight.to_string(),
        ];
        let optional = [
            ("--embedder-url", self.embedder_url.clone()),
            ("--reranker-url", self.reranker_url.clone()),
            ("--ner-url", self.ner_url.clone()),
            ("--workers", self.workers.map(|workers| workers.to_string())),
        ];
        for (flag, value) in optional {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        args
    }
}
