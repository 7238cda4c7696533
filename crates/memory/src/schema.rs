//! SQLite schema for the chunk table and its vector and full-text indexes.

use {sqlx::SqlitePool, tracing::debug};

use crate::error::{Error, Result};

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS chunks (
        id            TEXT PRIMARY KEY,
        uri           TEXT NOT NULL,
        content       TEXT NOT NULL,
        content_hash  TEXT NOT NULL,
        heading       TEXT NOT NULL DEFAULT '',
        section       TEXT NOT NULL DEFAULT '',
        parent_dir    TEXT NOT NULL DEFAULT '',
        memory_type   TEXT NOT NULL DEFAULT '',
        importance    INTEGER NOT NULL DEFAULT 3,
        reinforcement INTEGER NOT NULL DEFAULT 0,
        access_count  INTEGER NOT NULL DEFAULT 0,
        token_count   INTEGER NOT NULL DEFAULT 0,
        start_line    INTEGER NOT NULL DEFAULT 0,
        end_line      INTEGER NOT NULL DEFAULT 0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_uri ON chunks(uri)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_parent_dir ON chunks(parent_dir)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_memory_type ON chunks(memory_type)",
    r#"CREATE TABLE IF NOT EXISTS chunk_vectors (
        id        TEXT PRIMARY KEY,
        embedding BLOB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
];

const FTS_STATEMENT: &str = r#"CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    id UNINDEXED,
    content,
    uri,
    section,
    tokenize = 'unicode61'
)"#;

/// Create every table the store needs. Missing FTS5 support is fatal.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    sqlx::query(FTS_STATEMENT)
        .execute(pool)
        .await
        .map_err(|e| Error::config(format!("full-text index (fts5) unavailable: {e}")))?;
    debug!("memory schema ready");
    Ok(())
}

/// Record the embedding dimension on first open, reject a different one later.
pub async fn ensure_dimension(pool: &SqlitePool, dimension: usize) -> Result<()> {
    let stored: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'dimension'")
        .fetch_optional(pool)
        .await?;
    match stored {
        None => {
            sqlx::query("INSERT INTO meta (key, value) VALUES ('dimension', ?)")
                .bind(dimension.to_string())
                .execute(pool)
                .await?;
            Ok(())
        },
        Some(value) if value == dimension.to_string() => Ok(()),
        Some(value) => Err(Error::config(format!(
            "index was built with embedding dimension {value}, provider produces {dimension}; delete the index and re-run `index`"
        ))),
    }
}
