use crate::store::{StoredChunk, VectorHit, VectorRecord};
use crate::traits::VectorStore;
use crate::SearchError;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Collection {
    dimensions: usize,
    records: Vec<VectorRecord>,
}

/// Process-local vector store with cosine distance, for tests and offline runs.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collection: Mutex<Option<Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Collection>> {
        self.collection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, |collection| collection.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exists(&self) -> bool {
        self.lock().is_some()
    }
}

fn cosine_distance(left: &[f32], right: &[f32]) -> f64 {
    let dot: f64 = left
        .iter()
        .zip(right)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum();
    let norm = |values: &[f32]| {
        values
            .iter()
            .map(|value| f64::from(*value).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let denominator = norm(left) * norm(right);
    if denominator == 0.0 {
        return 1.0;
    }
    1.0 - dot / denominator
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn delete_collection(&self) -> Result<(), SearchError> {
        *self.lock() = None;
        Ok(())
    }

    async fn ensure_collection(&self, dimensions: usize) -> Result<(), SearchError> {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(Collection {
                dimensions,
                records: Vec::new(),
            });
        }
        Ok(())
    }

    async fn add(&self, records: &[VectorRecord]) -> Result<(), SearchError> {
        let mut guard = self.lock();
        let collection = guard
            .as_mut()
            .ok_or_else(|| SearchError::NotReady("collection does not exist".to_string()))?;

        for record in records {
            if record.embedding.len() != collection.dimensions {
                return Err(SearchError::Request(format!(
                    "embedding dimension {} != {}",
                    record.embedding.len(),
                    collection.dimensions
                )));
            }
            match collection
                .records
                .iter_mut()
                .find(|existing| existing.id == record.id)
            {
                Some(existing) => *existing = record.clone(),
                None => collection.records.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> Result<(), SearchError> {
        if let Some(collection) = self.lock().as_mut() {
            collection.records.retain(|record| !ids.contains(&record.id));
        }
        Ok(())
    }

    async fn query(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>, SearchError> {
        let guard = self.lock();
        let Some(collection) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut hits = collection
            .records
            .iter()
            .map(|record| VectorHit {
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                distance: cosine_distance(embedding, &record.embedding),
            })
            .collect::<Vec<_>>();
        hits.sort_by(|left, right| left.distance.total_cmp(&right.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_all(&self) -> Result<Vec<StoredChunk>, SearchError> {
        Ok(self
            .lock()
            .as_ref()
            .map(|collection| {
                collection
                    .records
                    .iter()
                    .map(|record| StoredChunk {
                        text: record.text.clone(),
                        metadata: record.metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
