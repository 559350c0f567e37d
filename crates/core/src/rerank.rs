use crate::traits::Reranker;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

#[derive(Debug, Deserialize)]
struct RankedPassage {
    index: usize,
    score: f32,
}

/// Cross-encoder service exposing `POST /rerank`.
pub struct HttpReranker {
    endpoint: Url,
    client: Client,
}

impl HttpReranker {
    pub fn new(base_url: &str) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: Url::parse(base_url)?.join("rerank")?,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, SearchError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "query": query, "texts": passages, "raw_scores": false }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "reranker".to_string(),
                details: response.status().to_string(),
            });
        }

        let ranked: Vec<RankedPassage> = response.json().await?;
        scores_in_passage_order(ranked, passages.len())
    }
}

/// The service answers sorted by relevance; callers want input order.
fn scores_in_passage_order(
    ranked: Vec<RankedPassage>,
    expected: usize,
) -> Result<Vec<f32>, SearchError> {
    let mut scores = vec![None; expected];
    for passage in ranked {
        let slot = scores
            .get_mut(passage.index)
            .ok_or_else(|| SearchError::BackendResponse {
                backend: "reranker".to_string(),
                details: format!("index {} out of range", passage.index),
            })?;
        *slot = Some(passage.score);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| SearchError::BackendResponse {
                backend: "reranker".to_string(),
                details: format!("no score for passage {index}"),
            })
        })
        .collect()
}
