use crate::traits::{Entity, EntityRecognizer};
use crate::SearchError;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct NerRequest<'a> {
    inputs: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct NerSpan {
    #[serde(alias = "entity")]
    entity_group: String,
    word: String,
}

/// Token-classification service speaking the `{"inputs": ...}` protocol.
#[derive(Debug, Clone)]
pub struct HttpEntityRecognizer {
    endpoint: Url,
    timeout: Duration,
    /// Built on first use: a blocking client cannot be created inside an async runtime.
    client: OnceLock<Client>,
}

impl HttpEntityRecognizer {
    pub fn new(endpoint: &str) -> Result<Self, SearchError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            timeout: Duration::from_secs(10),
            client: OnceLock::new(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = OnceLock::new();
        self
    }

    fn client(&self) -> Result<&Client, SearchError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder().timeout(self.timeout).build()?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl EntityRecognizer for HttpEntityRecognizer {
    fn recognize(&self, text: &str) -> Result<Vec<Entity>, SearchError> {
        let response = self
            .client()?
            .post(self.endpoint.clone())
            .json(&NerRequest { inputs: text })
            .send()?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "ner".to_string(),
                details: response.status().to_string(),
            });
        }

        let spans: Vec<NerSpan> = response.json()?;
        Ok(spans
            .into_iter()
            .map(|span| Entity {
                label: normalize_label(&span.entity_group),
                text: span.word.trim().to_string(),
            })
            .filter(|entity| !entity.text.is_empty())
            .collect())
    }
}

/// `B-PER`/`I-ORG` style tags collapse to their bare group name.
fn normalize_label(raw: &str) -> String {
    raw.trim_start_matches("B-")
        .trim_start_matches("I-")
        .to_ascii_uppercase()
}
