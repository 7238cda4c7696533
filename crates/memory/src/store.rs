/// Storage abstraction for indexed chunks, their vectors and full-text entries.
use {async_trait::async_trait, serde::Serialize};

use crate::error::Result;

/// A persisted chunk. `score` is only populated by searches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub uri: String,
    pub content: String,
    pub content_hash: String,
    pub heading: String,
    pub section: String,
    /// First path segment of `uri`, used as the scope filter.
    pub parent_dir: String,
    pub memory_type: String,
    pub importance: i64,
    pub reinforcement: i64,
    pub access_count: i64,
    pub token_count: i64,
    pub start_line: i64,
    pub end_line: i64,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub updated_at: String,
    pub score: f64,
}

/// Optional restrictions applied to a search before truncation.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Keep records whose `parent_dir` starts with this value.
    pub parent_dir: Option<String>,
    pub memory_type: Option<String>,
    pub uri: Option<String>,
}

impl SearchFilter {
    /// Map a retrieval scope to a filter: `""` and `"global"` mean no restriction.
    pub fn for_scope(scope: &str) -> Self {
        let scope = scope.trim();
        Self {
            parent_dir: (!scope.is_empty() && scope != "global").then(|| scope.to_string()),
            ..Self::default()
        }
    }

    pub fn for_uri(uri: &str) -> Self {
        Self {
            uri: Some(uri.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        self.parent_dir
            .as_deref()
            .is_none_or(|p| record.parent_dir.starts_with(p))
            && self
                .memory_type
                .as_deref()
                .is_none_or(|t| record.memory_type == t)
            && self.uri.as_deref().is_none_or(|u| record.uri == u)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_files: usize,
    pub dimension: usize,
    /// `(memory_type, chunk count)`, sorted by type.
    pub chunks_by_type: Vec<(String, usize)>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert or refresh a chunk. Counters and `created_at` survive an update.
    async fn upsert(&self, record: &ChunkRecord, embedding: &[f32]) -> Result<()>;

    /// Remove every chunk of `uri`; returns the number of rows removed.
    async fn delete_by_uri(&self, uri: &str) -> Result<usize>;

    /// Remove chunks of `uri` whose id is not in `keep_ids`.
    async fn delete_stale(&self, uri: &str, keep_ids: &[String]) -> Result<usize>;

    /// Cosine ranking, scores in `[0, 1]`, best first.
    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkRecord>>;

    /// BM25 ranking normalised into `[0, 1)`, best first.
    async fn fts_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkRecord>>;

    /// Records at or above `threshold` similarity, optionally restricted to one uri.
    async fn find_similar(
        &self,
        embedding: &[f32],
        uri: Option<&str>,
        threshold: f64,
        top_k: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let filter = uri.map(SearchFilter::for_uri).unwrap_or_default();
        let mut records = self.vector_search(embedding, top_k, &filter).await?;
        records.retain(|r| r.score >= threshold);
        Ok(records)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<ChunkRecord>>;

    /// Every chunk of `uri`, in line order.
    async fn get_by_uri(&self, uri: &str) -> Result<Vec<ChunkRecord>>;

    async fn increment_reinforcement(&self, id: &str) -> Result<()>;

    async fn increment_access_count(&self, ids: &[String]) -> Result<()>;

    /// Distinct uris, sorted.
    async fn get_all_uris(&self) -> Result<Vec<String>>;

    async fn get_max_reinforcement(&self) -> Result<i64>;

    async fn get_max_access_count(&self) -> Result<i64>;

    async fn get_stats(&self) -> Result<StoreStats>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(parent_dir: &str, memory_type: &str, uri: &str) -> ChunkRecord {
        ChunkRecord {
            parent_dir: parent_dir.into(),
            memory_type: memory_type.into(),
            uri: uri.into(),
            ..ChunkRecord::default()
        }
    }

    #[test]
    fn scope_filter_mapping() {
        assert!(SearchFilter::for_scope("").parent_dir.is_none());
        assert!(SearchFilter::for_scope("global").parent_dir.is_none());
        let user = SearchFilter::for_scope("user");
        assert!(user.matches(&record("user", "preference", "user/preferences.md")));
        assert!(!user.matches(&record("journal", "event", "journal/2024-01-01.md")));
    }

    #[test]
    fn filters_combine() {
        let filter = SearchFilter {
            memory_type: Some("decision".into()),
            uri: Some("agent/decisions.md".into()),
            ..SearchFilter::default()
        };
        assert!(filter.matches(&record("agent", "decision", "agent/decisions.md")));
        assert!(!filter.matches(&record("agent", "pattern", "agent/decisions.md")));
        assert!(!filter.matches(&record("agent", "decision", "agent/patterns.md")));
    }
}
