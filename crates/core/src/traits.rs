use crate::store::{StoredChunk, VectorHit, VectorRecord};
use crate::SearchError;
use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError>;
}

/// Semantic store holding one named collection.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Drops the collection; a missing collection is not an error.
    async fn delete_collection(&self) -> Result<(), SearchError>;

    async fn ensure_collection(&self, dimensions: usize) -> Result<(), SearchError>;

    async fn add(&self, records: &[VectorRecord]) -> Result<(), SearchError>;

    /// Deletes records by id; unknown ids are ignored.
    async fn remove(&self, ids: &[String]) -> Result<(), SearchError>;

    async fn query(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>, SearchError>;

    async fn get_all(&self) -> Result<Vec<StoredChunk>, SearchError>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// One relevance score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub label: String,
    pub text: String,
}

/// Called from extraction workers, so it is synchronous.
pub trait EntityRecognizer: Send + Sync {
    fn recognize(&self, text: &str) -> Result<Vec<Entity>, SearchError>;
}
