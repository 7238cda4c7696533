//! Memory management: markdown notes → chunked → embedded → hybrid search in
//! SQLite, plus a gated writer that routes new facts to the right note.

pub mod chunker;
pub mod config;
pub mod embeddings;
#[cfg(feature = "local-embeddings")]
pub mod embeddings_local;
pub mod embeddings_ollama;
pub mod embeddings_openai;
pub mod error;
pub mod indexer;
pub mod manager;
pub mod notes;
pub mod primer;
pub mod privacy;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
#[cfg(feature = "file-watcher")]
pub mod watcher;
pub mod writer;

#[cfg(test)]
mod testing;

pub use {
    config::{MemoryConfig, load_config},
    error::{EmbeddingError, Error, Result},
    manager::MemoryManager,
};
