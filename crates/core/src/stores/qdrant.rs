use crate::models::ChunkRecord;
use crate::store::{point_id, StoredChunk, VectorHit, VectorRecord};
use crate::traits::VectorStore;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

const SCROLL_PAGE: usize = 256;

/// Vector store backed by a Qdrant collection over its REST API.
///
/// Distances are reported as `1 - cosine similarity` so callers see the same
/// convention as any other store.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(endpoint: &str, collection: impl Into<String>) -> Result<Self, SearchError> {
        Url::parse(endpoint)?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    async fn check(response: Response) -> Result<Value, SearchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: "qdrant".to_string(),
                details: format!("{status}: {body}"),
            });
        }
        Ok(response.json().await?)
    }
}

fn point_payload(record: &VectorRecord) -> Result<Value, SearchError> {
    let mut payload = serde_json::to_value(&record.metadata)?;
    if let Value::Object(fields) = &mut payload {
        fields.insert("document".to_string(), Value::String(record.text.clone()));
        fields.insert("record_id".to_string(), Value::String(record.id.clone()));
    }
    Ok(payload)
}

fn stored_chunk(point: &Value) -> Result<StoredChunk, SearchError> {
    let payload = point
        .pointer("/payload")
        .cloned()
        .ok_or_else(|| SearchError::BackendResponse {
            backend: "qdrant".to_string(),
            details: "point without payload".to_string(),
        })?;
    let text = payload
        .pointer("/document")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let metadata: ChunkRecord = serde_json::from_value(payload)?;
    Ok(StoredChunk { text, metadata })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn delete_collection(&self) -> Result<(), SearchError> {
        let response = self.client.delete(self.collection_url()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(collection = %self.collection, "collection did not exist");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn ensure_collection(&self, dimensions: usize) -> Result<(), SearchError> {
        let existing = self.client.get(self.collection_url()).send().await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Self::check(existing).await.map(|_| ());
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": dimensions, "distance": "Cosine" }
            }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn add(&self, records: &[VectorRecord]) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let points = records
            .iter()
            .map(|record| {
                Ok(json!({
                    "id": record.numeric_id(),
                    "vector": record.embedding,
                    "payload": point_payload(record)?,
                }))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> Result<(), SearchError> {
        if ids.is_empty() {
            return Ok(());
        }

        let points = ids.iter().map(|id| point_id(id)).collect::<Vec<_>>();
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn query(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>, SearchError> {
        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": embedding,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let parsed = Self::check(response).await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::with_capacity(hits.len());
        for hit in hits {
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
            let chunk = stored_chunk(&hit)?;
            result.push(VectorHit {
                text: chunk.text,
                metadata: chunk.metadata,
                distance: 1.0 - score,
            });
        }
        Ok(result)
    }

    async fn get_all(&self) -> Result<Vec<StoredChunk>, SearchError> {
        let mut chunks = Vec::new();
        let mut offset = Value::Null;

        loop {
            let response = self
                .client
                .post(format!("{}/points/scroll", self.collection_url()))
                .json(&json!({
                    "limit": SCROLL_PAGE,
                    "offset": offset,
                    "with_payload": true,
                    "with_vector": false,
                }))
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }

            let parsed = Self::check(response).await?;
            let points = parsed
                .pointer("/result/points")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for point in &points {
                chunks.push(stored_chunk(point)?);
            }

            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() || points.is_empty() {
                break;
            }
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Language, PageId};
    use std::collections::BTreeMap;

    fn record() -> VectorRecord {
        let metadata = ChunkRecord {
            filename: "ops/Budget.xlsx".to_string(),
            page: PageId::Name("Q1".to_string()),
            chunk: 0,
            total_pages: 2,
            language: Language::En,
            patterns: BTreeMap::from([("sop".to_string(), "SOP".to_string())]),
            sheet_title: Some("Q1".to_string()),
            total_cells: Some(4),
            file_type: "xlsx".to_string(),
            file_size: 900,
            created_at: None,
            modified_at: Some("2024-05-01T00:00:00+00:00".to_string()),
            persons: None,
            orgs: None,
        };
        VectorRecord {
            id: metadata.record_id(),
            text: "A1: total".to_string(),
            embedding: vec![0.1, 0.2],
            metadata,
        }
    }

    #[test]
    fn payload_round_trips_through_point_json() -> Result<(), SearchError> {
        let record = record();
        let point = json!({ "id": record.numeric_id(), "payload": point_payload(&record)? });

        let chunk = stored_chunk(&point)?;

        assert_eq!(chunk.text, "A1: total");
        assert_eq!(chunk.metadata, record.metadata);
        assert_eq!(
            point.pointer("/payload/record_id").and_then(Value::as_str),
            Some("ops/Budget.xlsx_Q1_0")
        );
        Ok(())
    }

    #[test]
    fn endpoint_is_validated_and_normalized() -> Result<(), SearchError> {
        assert!(QdrantStore::new("not a url", "docs").is_err());
        let store = QdrantStore::new("http://localhost:6333/", "docs")?;
        assert_eq!(store.collection_url(), "http://localhost:6333/collections/docs");
        Ok(())
    }
}
