use crate::traits::Embedder;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1024;

/// Prefix for indexed passages, paired with [`QUERY_PREFIX`] at search time.
pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";

/// Hashes character trigrams into a fixed-size, L2-normalized vector.
///
/// Deterministic and offline; used when no embedding service is configured.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Client for a text-embeddings service exposing `POST /embed`.
pub struct HttpEmbedder {
    endpoint: Url,
    client: Client,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, dimensions: usize) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: Url::parse(base_url)?.join("embed")?,
            client: Client::new(),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "inputs": texts, "normalize": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "embedder".to_string(),
                details: response.status().to_string(),
            });
        }

        let vectors: Vec<Vec<f32>> = response.json().await?;
        if vectors.len() != texts.len() {
            return Err(SearchError::BackendResponse {
                backend: "embedder".to_string(),
                details: format!("{} vectors for {} inputs", vectors.len(), texts.len()),
            });
        }
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.dimensions) {
            return Err(SearchError::BackendResponse {
                backend: "embedder".to_string(),
                details: format!("dimension {} != {}", bad.len(), self.dimensions),
            });
        }

        Ok(vectors)
    }
}
