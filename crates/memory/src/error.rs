//! Error types for the memory subsystem.
//!
//! Quality-gate rejections are not errors: they come back as a
//! [`WriteOutcome`](crate::writer::WriteOutcome) with a reason code.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing credentials, unknown provider, invalid regex, bad config file.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frontmatter: {0}")]
    Frontmatter(#[from] serde_yaml::Error),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("no project detected; run inside a project directory")]
    NoProject,

    #[error("path is outside the memory roots: {}", .0.display())]
    OutsideMemoryRoot(PathBuf),

    #[cfg(feature = "file-watcher")]
    #[error("file watcher error: {0}")]
    Watch(#[from] notify_debouncer_full::notify::Error),
}

/// Failures raised by an embedding backend.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("expected {expected} embeddings, provider returned {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("local embedding model failed: {0}")]
    Local(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
