pub mod chunking;
pub mod embeddings;
pub mod enrich;
pub mod entities;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod lexical;
pub mod library;
pub mod models;
pub mod ooxml;
pub mod process;
pub mod rerank;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{ChunkingConfig, TextChunker};
pub use embeddings::{CharacterNgramEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use enrich::MetadataEnricher;
pub use entities::HttpEntityRecognizer;
pub use error::{FileOpError, IngestError, SearchError};
pub use extractor::{extract_file, DocumentExtractor, PdfExtractor};
pub use index::IndexBuilder;
pub use ingest::{
    discover_documents, run_ingestion, ExtractionOrchestrator, IngestionReport, ProcessedFile,
    SkippedFile,
};
pub use lexical::LexicalIndex;
pub use library::{DocumentLibrary, LibraryOptions, StoredDocument};
pub use models::{
    ChunkRecord, FileType, IndexOptions, IngestionOptions, Language, ListDocumentsResult, Page,
    PageId, RetrievalOptions, SearchDocumentsResult, SearchResult,
};
pub use ooxml::{DocxExtractor, PptxExtractor, SpreadsheetExtractor};
pub use process::{
    CommandLauncher, ControlOutcome, IngestionManager, ProcessLauncher, RunSnapshot, RunStatus,
};
pub use rerank::HttpReranker;
pub use retrieval::HybridRetriever;
pub use stores::{InMemoryVectorStore, QdrantStore};
pub use traits::{Embedder, EntityRecognizer, Reranker, VectorStore};
