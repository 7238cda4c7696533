//! Deterministic embedders shared by the unit tests.
#![allow(clippy::unwrap_used)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{embeddings::EmbeddingProvider, error::Result, store_sqlite::SqliteMemoryStore};

const KEYWORDS: [&str; 8] = [
    "rust", "python", "database", "memory", "search", "network", "cooking", "music",
];

/// One dimension per keyword plus a small bias so no text maps to the zero vector.
pub(crate) struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn embedding(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = KEYWORDS
            .iter()
            .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
            .collect();
        v.push(0.1);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::embedding(t)).collect())
    }

    fn model_name(&self) -> &str {
        "keyword-mock"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len() + 1
    }

    fn provider_key(&self) -> &str {
        "keyword-mock"
    }
}

/// Returns the vector of the first rule whose needle occurs in the text.
pub(crate) struct ScriptedEmbedder {
    rules: Vec<(String, Vec<f32>)>,
    fallback: Vec<f32>,
}

impl ScriptedEmbedder {
    pub fn new(rules: &[(&str, [f32; 3])]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|(needle, v)| ((*needle).to_string(), v.to_vec()))
                .collect(),
            fallback: vec![0.0, 0.0, 1.0],
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                self.rules
                    .iter()
                    .find(|(needle, _)| text.contains(needle.as_str()))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| self.fallback.clone())
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "scripted-mock"
    }

    fn dimensions(&self) -> usize {
        3
    }

    fn provider_key(&self) -> &str {
        "scripted-mock"
    }
}

pub(crate) async fn keyword_store() -> Arc<SqliteMemoryStore> {
    Arc::new(SqliteMemoryStore::in_memory(KEYWORDS.len() + 1).await.unwrap())
}

pub(crate) async fn scripted_store() -> Arc<SqliteMemoryStore> {
    Arc::new(SqliteMemoryStore::in_memory(3).await.unwrap())
}
