//! HTTP embedding provider for an OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{retry, Error, Result};

/// Inputs longer than this are rejected as `Permanent` — the caller chunks
/// first; re-sending the same oversized text can never succeed.
const MAX_INPUT_CHARS: usize = 32_000;

pub struct RemoteEmbeddings {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbeddings {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Permanent(format!("embedding client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
            max_retries: config.max_retries.max(1),
        })
    }

    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_http(e, "embeddings request"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("embeddings body: {e}")))?;

        if status.is_server_error() {
            return Err(Error::Transient(format!("embeddings: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Permanent(format!("embeddings: HTTP {status}")));
        }

        // A load balancer in front of the service may return HTML error pages
        // with a 200; don't feed those to the JSON parser blindly.
        let trimmed = text.trim_start();
        if trimmed.starts_with('<') {
            return Err(Error::Transient(
                "embeddings endpoint returned HTML instead of JSON".into(),
            ));
        }

        let parsed: EmbeddingsResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Permanent(format!("embeddings parse: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(Error::Permanent(format!(
                "embeddings: expected {} vectors, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // The API reports an index per item; order by it so batching always
        // preserves input order.
        let mut items = parsed.data;
        items.sort_by_key(|item| item.index);

        let mut vectors = Vec::with_capacity(items.len());
        for item in items {
            if item.embedding.len() != self.dimension {
                return Err(Error::Permanent(format!(
                    "embeddings: dimension {} does not match configured {}",
                    item.embedding.len(),
                    self.dimension
                )));
            }
            let mut vector = item.embedding;
            normalize(&mut vector);
            vectors.push(vector);
        }
        Ok(vectors)
    }

    fn check_input(text: &str) -> Result<()> {
        if text.len() > MAX_INPUT_CHARS {
            return Err(Error::Permanent(format!(
                "embedding input too long ({} chars, max {MAX_INPUT_CHARS}); chunk first",
                text.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddings {
    async fn embed(&self, text: &str, task: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("cannot embed empty text".into()));
        }
        let batch = self.embed_batch(&[text.to_string()], task).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| Error::Permanent("embeddings: empty response".into()))
    }

    async fn embed_batch(&self, texts: &[String], _task: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for text in texts {
            Self::check_input(text)?;
        }

        retry(self.max_retries, Duration::from_millis(500), || {
            self.request_batch(texts)
        })
        .await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_input_is_permanent() {
        let text = "a".repeat(MAX_INPUT_CHARS + 1);
        assert!(matches!(
            RemoteEmbeddings::check_input(&text),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut vector = vec![3.0, 4.0];
        normalize(&mut vector);
        assert!((vector[0] - 0.6).abs() < 1e-6);
        assert!((vector[1] - 0.8).abs() < 1e-6);
    }
}
