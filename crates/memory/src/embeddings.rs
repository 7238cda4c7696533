//! Embedding backends and the helpers that wrap every call with a timeout.

use std::{sync::Arc, time::Duration};

use {async_trait::async_trait, tracing::debug};

use crate::{
    config::{EmbeddingConfig, EmbeddingProviderKind},
    embeddings_ollama::OllamaEmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
    error::{EmbeddingError, Error, Result},
};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| {
                EmbeddingError::MalformedResponse("empty embedding response".into()).into()
            })
    }

    /// Embed several texts in one round trip; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Stable identifier of backend + model, used to detect index drift.
    fn provider_key(&self) -> &str;
}

/// Build the provider selected by `config`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let model = config.resolved_model().to_string();
    let dims = config.resolved_dimension();
    debug!(provider = ?config.provider, %model, dims, "creating embedding provider");

    match config.provider {
        EmbeddingProviderKind::OpenAi => {
            let api_key = config
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    Error::config("openai embeddings require embedding.api_key or OPENAI_API_KEY")
                })?;
            let mut provider = OpenAiEmbeddingProvider::new(api_key, config.timeout())
                .with_model(model, dims);
            if !config.base_url.is_empty() {
                provider = provider.with_base_url(config.base_url.clone());
            }
            Ok(Arc::new(provider))
        },
        EmbeddingProviderKind::Ollama => {
            let mut provider = OllamaEmbeddingProvider::new(model, dims, config.timeout());
            if !config.base_url.is_empty() {
                provider = provider.with_base_url(config.base_url.clone());
            }
            Ok(Arc::new(provider))
        },
        #[cfg(feature = "local-embeddings")]
        EmbeddingProviderKind::Local => Ok(Arc::new(
            crate::embeddings_local::LocalEmbeddingProvider::new(&model, dims)?,
        )),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProviderKind::Local => Err(Error::config(
            "local embeddings require the `local-embeddings` feature",
        )),
    }
}

/// Embed one text, failing with [`Error::Timeout`] past `timeout`.
pub async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let vector = tokio::time::timeout(timeout, provider.embed(text))
        .await
        .map_err(|_| Error::Timeout {
            operation: "embedding",
            seconds: timeout.as_secs(),
        })??;
    check_dimension(provider, &vector)?;
    Ok(vector)
}

/// Embed a batch with a timeout, verifying count and dimension of the result.
pub async fn embed_batch_with_timeout(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = tokio::time::timeout(timeout, provider.embed_batch(texts))
        .await
        .map_err(|_| Error::Timeout {
            operation: "batch embedding",
            seconds: timeout.as_secs(),
        })??;
    if vectors.len() != texts.len() {
        return Err(EmbeddingError::CountMismatch {
            expected: texts.len(),
            actual: vectors.len(),
        }
        .into());
    }
    for vector in &vectors {
        check_dimension(provider, vector)?;
    }
    Ok(vectors)
}

fn check_dimension(provider: &dyn EmbeddingProvider, vector: &[f32]) -> Result<()> {
    if vector.len() != provider.dimensions() {
        return Err(Error::DimensionMismatch {
            expected: provider.dimensions(),
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct Slow;

    #[async_trait]
    impl EmbeddingProvider for Slow {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(texts.iter().map(|_| vec![0.0; 2]).collect())
        }

        fn model_name(&self) -> &str {
            "slow"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider_key(&self) -> &str {
            "slow"
        }
    }

    struct Short;

    #[async_trait]
    impl EmbeddingProvider for Short {
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0]])
        }

        fn model_name(&self) -> &str {
            "short"
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn provider_key(&self) -> &str {
            "short"
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let err = embed_with_timeout(&Slow, "hi", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn batch_count_and_dimension_are_checked() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_batch_with_timeout(&Short, &texts, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Embedding(EmbeddingError::CountMismatch {
                expected: 2,
                actual: 1
            })
        ));

        let err = embed_with_timeout(&Short, "a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch {
            expected: 3,
            actual: 2
        }));
    }

    #[test]
    fn openai_without_key_is_config_error() {
        let config = EmbeddingConfig {
            provider: EmbeddingProviderKind::OpenAi,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(create_provider(&config), Err(Error::Config(_))));
    }

    #[test]
    fn ollama_provider_uses_defaults() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "nomic-embed-text");
        assert_eq!(provider.dimensions(), 768);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
