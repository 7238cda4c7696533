/// SQLite-backed memory store: chunk rows, an exact cosine vector scan and FTS5.
use std::{path::Path, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    },
    tracing::debug,
};

use crate::{
    embeddings::cosine_similarity,
    error::{Error, Result},
    schema::{ensure_dimension, run_migrations},
    store::{ChunkRecord, MemoryStore, SearchFilter, StoreStats},
};

const COLUMNS: &str = "c.id, c.uri, c.content, c.content_hash, c.heading, c.section, \
    c.parent_dir, c.memory_type, c.importance, c.reinforcement, c.access_count, \
    c.token_count, c.start_line, c.end_line, c.created_at, c.updated_at";

/// Upper bound on terms passed to an FTS5 MATCH expression.
const MAX_FTS_TERMS: usize = 32;

pub struct SqliteMemoryStore {
    pool: SqlitePool,
    dimension: usize,
}

impl SqliteMemoryStore {
    /// Wrap an existing pool, creating the schema and pinning `dimension`.
    pub async fn new(pool: SqlitePool, dimension: usize) -> Result<Self> {
        run_migrations(&pool).await?;
        ensure_dimension(&pool, dimension).await?;
        Ok(Self { pool, dimension })
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), dimension, "opened memory store");
        Self::new(pool, dimension).await
    }

    /// Private in-memory database; lives as long as the store.
    pub async fn in_memory(dimension: usize) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool, dimension).await
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine distance clamped to `[0, 1]`; opposite vectors saturate at 1.
fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    (1.0 - f64::from(cosine_similarity(a, b))).clamp(0.0, 1.0)
}

/// Map a raw distance onto `[0, 1]`, tolerating unbounded distance metrics.
fn distance_to_similarity(distance: f64) -> f64 {
    if distance <= 1.0 {
        1.0 - distance.max(0.0)
    } else {
        1.0 / (1.0 + distance)
    }
}

/// BM25 from SQLite is negative, lower is better. Map it to `[0, 1)`.
fn normalize_bm25(raw: f64) -> f64 {
    let s = (-raw).max(0.0);
    s / (1.0 + s)
}

/// Build a MATCH expression of quoted terms joined by OR, or `None` if nothing is searchable.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(MAX_FTS_TERMS)
        .map(|t| format!("\"{t}\""))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

fn record_from_row(row: &SqliteRow) -> std::result::Result<ChunkRecord, sqlx::Error> {
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        uri: row.try_get("uri")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        heading: row.try_get("heading")?,
        section: row.try_get("section")?,
        parent_dir: row.try_get("parent_dir")?,
        memory_type: row.try_get("memory_type")?,
        importance: row.try_get("importance")?,
        reinforcement: row.try_get("reinforcement")?,
        access_count: row.try_get("access_count")?,
        token_count: row.try_get("token_count")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        score: 0.0,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn upsert(&self, record: &ChunkRecord, embedding: &[f32]) -> Result<()> {
        self.check_dimension(embedding)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO chunks (id, uri, content, content_hash, heading, section, parent_dir,
                memory_type, importance, reinforcement, access_count, token_count, start_line,
                end_line, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                uri          = excluded.uri,
                content      = excluded.content,
                content_hash = excluded.content_hash,
                heading      = excluded.heading,
                section      = excluded.section,
                parent_dir   = excluded.parent_dir,
                memory_type  = excluded.memory_type,
                importance   = excluded.importance,
                token_count  = excluded.token_count,
                start_line   = excluded.start_line,
                end_line     = excluded.end_line,
                updated_at   = excluded.updated_at"#,
        )
        .bind(&record.id)
        .bind(&record.uri)
        .bind(&record.content)
        .bind(&record.content_hash)
        .bind(&record.heading)
        .bind(&record.section)
        .bind(&record.parent_dir)
        .bind(&record.memory_type)
        .bind(record.importance)
        .bind(record.reinforcement)
        .bind(record.access_count)
        .bind(record.token_count)
        .bind(record.start_line)
        .bind(record.end_line)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO chunk_vectors (id, embedding) VALUES (?, ?)")
            .bind(&record.id)
            .bind(encode_vector(embedding))
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (id, content, uri, section) VALUES (?, ?, ?, ?)")
            .bind(&record.id)
            .bind(&record.content)
            .bind(&record.uri)
            .bind(&record.section)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_uri(&self, uri: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE id IN (SELECT id FROM chunks WHERE uri = ?)")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE id IN (SELECT id FROM chunks WHERE uri = ?)")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE uri = ?")
            .bind(uri)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!(%uri, removed, "deleted chunks for uri");
        Ok(removed as usize)
    }

    async fn delete_stale(&self, uri: &str, keep_ids: &[String]) -> Result<usize> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE uri = ?")
            .bind(uri)
            .fetch_all(&self.pool)
            .await?;
        let stale: Vec<String> = ids.into_iter().filter(|id| !keep_ids.contains(id)).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &stale {
            for sql in [
                "DELETE FROM chunks_fts WHERE id = ?",
                "DELETE FROM chunk_vectors WHERE id = ?",
                "DELETE FROM chunks WHERE id = ?",
            ] {
                sqlx::query(sql).bind(id).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        debug!(%uri, removed = stale.len(), "deleted stale chunks");
        Ok(stale.len())
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkRecord>> {
        self.check_dimension(embedding)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS}, v.embedding FROM chunks c \
             JOIN chunk_vectors v ON v.id = c.id ORDER BY c.uri, c.start_line"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut scored = Vec::new();
        for row in &rows {
            let mut record = record_from_row(row)?;
            if !filter.matches(&record) {
                continue;
            }
            let blob: Vec<u8> = row.try_get("embedding")?;
            record.score = distance_to_similarity(cosine_distance(embedding, &decode_vector(&blob)));
            scored.push(record);
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn fts_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ChunkRecord>> {
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {COLUMNS}, bm25(chunks_fts) AS bm25_score FROM chunks_fts \
             JOIN chunks c ON c.id = chunks_fts.id WHERE chunks_fts MATCH ?"
        );
        if filter.parent_dir.is_some() {
            sql.push_str(" AND instr(c.parent_dir, ?) = 1");
        }
        if filter.memory_type.is_some() {
            sql.push_str(" AND c.memory_type = ?");
        }
        if filter.uri.is_some() {
            sql.push_str(" AND c.uri = ?");
        }
        sql.push_str(" ORDER BY bm25_score LIMIT ?");

        let mut query = sqlx::query(&sql).bind(expr);
        if let Some(parent_dir) = &filter.parent_dir {
            query = query.bind(parent_dir.as_str());
        }
        if let Some(memory_type) = &filter.memory_type {
            query = query.bind(memory_type.as_str());
        }
        if let Some(uri) = &filter.uri {
            query = query.bind(uri.as_str());
        }
        let rows = query
            .bind(i64::try_from(top_k).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ChunkRecord> {
                let mut record = record_from_row(row)?;
                let raw: f64 = row.try_get("bm25_score")?;
                record.score = normalize_bm25(raw);
                Ok(record)
            })
            .collect()
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM chunks c WHERE c.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn get_by_uri(&self, uri: &str) -> Result<Vec<ChunkRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM chunks c WHERE c.uri = ? ORDER BY c.start_line");
        let rows = sqlx::query(&sql).bind(uri).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(record_from_row)
            .collect::<std::result::Result<Vec<ChunkRecord>, sqlx::Error>>()?)
    }

    async fn increment_reinforcement(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE chunks SET reinforcement = reinforcement + 1, updated_at = ? WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_access_count(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_rfc3339();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE chunks SET access_count = access_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_all_uris(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT uri FROM chunks ORDER BY uri")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn get_max_reinforcement(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COALESCE(MAX(reinforcement), 0) FROM chunks")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn get_max_access_count(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COALESCE(MAX(access_count), 0) FROM chunks")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn get_stats(&self) -> Result<StoreStats> {
        let (total_chunks, total_files): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(DISTINCT uri) FROM chunks")
                .fetch_one(&self.pool)
                .await?;
        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT memory_type, COUNT(*) FROM chunks GROUP BY memory_type ORDER BY memory_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(StoreStats {
            total_chunks: total_chunks as usize,
            total_files: total_files as usize,
            dimension: self.dimension,
            chunks_by_type: by_type
                .into_iter()
                .map(|(t, n)| (t, n as usize))
                .collect(),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
