//! Offline embeddings through `fastembed`, loaded lazily on first use.

use std::sync::Arc;

use {
    async_trait::async_trait,
    fastembed::{EmbeddingModel, InitOptions, TextEmbedding},
    tokio::sync::OnceCell,
    tracing::info,
};

use crate::{
    chunker::short_sha256,
    embeddings::EmbeddingProvider,
    error::{EmbeddingError, Error, Result},
};

pub struct LocalEmbeddingProvider {
    model: OnceCell<Arc<TextEmbedding>>,
    kind: EmbeddingModel,
    model_name: String,
    dims: usize,
    provider_key: String,
}

fn model_for_name(name: &str) -> Option<EmbeddingModel> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            Some(EmbeddingModel::AllMiniLML6V2)
        },
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
        "nomic-embed-text-v1.5" => Some(EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" | "intfloat/multilingual-e5-small" => {
            Some(EmbeddingModel::MultilingualE5Small)
        },
        _ => None,
    }
}

impl LocalEmbeddingProvider {
    pub fn new(model_name: &str, dims: usize) -> Result<Self> {
        let kind = model_for_name(model_name)
            .ok_or_else(|| Error::config(format!("unsupported local embedding model: {model_name}")))?;
        Ok(Self {
            model: OnceCell::new(),
            kind,
            model_name: model_name.to_string(),
            dims,
            provider_key: short_sha256(&format!("local:{model_name}")),
        })
    }

    async fn model(&self) -> Result<Arc<TextEmbedding>> {
        let kind = self.kind.clone();
        let name = self.model_name.clone();
        self.model
            .get_or_try_init(|| async move {
                info!(model = %name, "loading local embedding model");
                match tokio::task::spawn_blocking(move || load_model(kind)).await {
                    Ok(result) => result,
                    Err(e) => Err(EmbeddingError::Local(e.to_string()).into()),
                }
            })
            .await
            .cloned()
    }
}

fn load_model(kind: EmbeddingModel) -> Result<Arc<TextEmbedding>> {
    let mut options = InitOptions::default();
    options.model_name = kind;
    options.show_download_progress = false;
    TextEmbedding::try_new(options)
        .map(Arc::new)
        .map_err(|e| EmbeddingError::Local(e.to_string()).into())
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|e| EmbeddingError::Local(e.to_string()))?
            .map_err(|e| EmbeddingError::Local(e.to_string()).into())
    }

    fn model_name(&self) -> &str {
        &self.model_name
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
    fn known_model_names_resolve() {
        assert!(model_for_name("all-MiniLM-L6-v2").is_some());
        assert!(model_for_name("BAAI/bge-small-en-v1.5").is_some());
        assert!(model_for_name("gpt-2").is_none());
        assert!(matches!(
            LocalEmbeddingProvider::new("gpt-2", 384),
            Err(Error::Config(_))
        ));
    }
}
