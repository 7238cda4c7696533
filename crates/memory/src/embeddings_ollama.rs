/// Ollama embeddings provider using the batched `/api/embed` endpoint.
use std::time::Duration;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::{
    chunker::short_sha256,
    embeddings::EmbeddingProvider,
    error::{EmbeddingError, Result},
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

fn compute_provider_key(base_url: &str, model: &str) -> String {
    short_sha256(&format!("ollama:{base_url}:{model}"))
}

fn embed_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/api/embed") {
        normalized.to_string()
    } else {
        format!("{normalized}/api/embed")
    }
}

impl OllamaEmbeddingProvider {
    pub fn new(model: String, dims: usize, timeout: Duration) -> Self {
        let base_url = DEFAULT_BASE_URL.to_string();
        let provider_key = compute_provider_key(&base_url, &model);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            model,
            dims,
            provider_key,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(embed_endpoint(&self.base_url))
            .json(&req)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(EmbeddingError::from)?
            .json::<EmbedResponse>()
            .await
            .map_err(EmbeddingError::from)?;
        Ok(resp.embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_api_embed() {
        assert_eq!(
            embed_endpoint("http://localhost:11434/"),
            "http://localhost:11434/api/embed"
        );
        assert_eq!(
            embed_endpoint("http://gpu-box:11434/api/embed"),
            "http://gpu-box:11434/api/embed"
        );
    }

    #[test]
    fn provider_key_depends_on_host() {
        let local = OllamaEmbeddingProvider::new("nomic-embed-text".into(), 768, Duration::from_secs(5));
        let remote = OllamaEmbeddingProvider::new("nomic-embed-text".into(), 768, Duration::from_secs(5))
            .with_base_url("http://gpu-box:11434".into());
        assert_ne!(local.provider_key(), remote.provider_key());
    }
}
