//! OpenAI-compatible embeddings via the `/v1/embeddings` endpoint.

use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{
    chunker::short_sha256,
    embeddings::EmbeddingProvider,
    error::{EmbeddingError, Result},
};

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

fn compute_provider_key(base_url: &str, model: &str) -> String {
    short_sha256(&format!("openai:{base_url}:{model}"))
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if normalized.ends_with("/v1") || has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        let base_url = normalize_base_url("https://api.openai.com");
        let model = "text-embedding-3-small".to_string();
        let provider_key = compute_provider_key(&base_url, &model);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: Secret::new(api_key),
            base_url,
            model,
            dims: 1536,
            provider_key,
        }
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = normalize_base_url(&url);
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let resp = self
            .client
            .post(embeddings_endpoint(&self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&req)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(EmbeddingError::from)?
            .json::<EmbeddingResponse>()
            .await
            .map_err(EmbeddingError::from)?;

        let mut data = resp.data;
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(data.into_iter().map(|d| d.embedding).collect())
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
