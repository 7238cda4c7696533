//! Directory indexing: markdown files → chunks → embeddings → store, with
//! reconciliation of files that disappeared since the last run.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    time::Duration,
};

use {
    chrono::{DateTime, NaiveDate, Utc},
    tracing::{debug, info, warn},
    walkdir::WalkDir,
};

use crate::{
    chunker::{Chunk, DEFAULT_MAX_CHUNK_TOKENS, chunk_markdown},
    embeddings::{EmbeddingProvider, embed_batch_with_timeout},
    error::{Error, Result},
    store::{ChunkRecord, MemoryStore},
};

/// Derived views regenerated from other files; never indexed as sources.
pub const GENERATED_FILES: [&str; 2] = ["PRIMER.md", "TASKS.md"];

/// Path fragments that imply a memory type when frontmatter has none.
const TYPE_BY_PATH: [(&str, &str); 6] = [
    ("preferences", "preference"),
    ("instructions", "instruction"),
    ("entities", "entity"),
    ("decisions", "decision"),
    ("patterns", "pattern"),
    ("journal", "event"),
];

const DEFAULT_IMPORTANCE: i64 = 3;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub max_chunk_tokens: usize,
    pub embed_timeout: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_chunk_tokens: DEFAULT_MAX_CHUNK_TOKENS,
            embed_timeout: Duration::from_secs(30),
        }
    }
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "markdown")
    )
}

fn is_generated(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| GENERATED_FILES.contains(&name))
}

/// Whether `path` is a markdown source that belongs in the index.
pub fn is_indexable(path: &Path) -> bool {
    is_markdown(path) && !is_generated(path)
}

/// Markdown files under `root`, skipping hidden directories and generated files.
pub fn scan_markdown_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .flatten()
        .filter(|entry| entry.file_type().is_file() && is_indexable(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// `path` relative to `root`, always `/`-separated.
pub fn relative_uri(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::OutsideMemoryRoot(path.to_path_buf()))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// First path segment of a uri, empty for files at the root.
pub fn parent_dir(uri: &str) -> &str {
    uri.split_once('/').map(|(first, _)| first).unwrap_or("")
}

/// Memory type implied by the path, empty when nothing matches.
pub fn type_from_uri(uri: &str) -> &'static str {
    TYPE_BY_PATH
        .iter()
        .find(|(fragment, _)| uri.contains(fragment))
        .map(|(_, memory_type)| *memory_type)
        .unwrap_or("")
}

/// `YYYY-MM-DD` or RFC 3339 frontmatter value as an RFC 3339 timestamp.
fn frontmatter_timestamp(chunk: &Chunk, key: &str) -> Option<String> {
    let value = chunk.metadata.get(key)?.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc).to_rfc3339());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().to_rfc3339())
}

fn to_record(chunk: &Chunk, uri: &str, file_modified: &str) -> ChunkRecord {
    let memory_type = chunk
        .metadata
        .get("type")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| type_from_uri(uri))
        .to_string();
    let importance = chunk
        .metadata
        .get("importance")
        .and_then(|v| v.as_i64())
        .map(|i| i.clamp(1, 5))
        .unwrap_or(DEFAULT_IMPORTANCE);
    let updated_at =
        frontmatter_timestamp(chunk, "updated").unwrap_or_else(|| file_modified.to_string());
    let created_at = frontmatter_timestamp(chunk, "created").unwrap_or_else(|| updated_at.clone());

    ChunkRecord {
        id: chunk.chunk_id(),
        uri: uri.to_string(),
        content: chunk.content.clone(),
        content_hash: chunk.content_hash.clone(),
        heading: chunk.heading.clone(),
        section: chunk.section.as_str().to_string(),
        parent_dir: parent_dir(uri).to_string(),
        memory_type,
        importance,
        reinforcement: 0,
        access_count: 0,
        token_count: chunk.token_count as i64,
        start_line: chunk.start_line as i64,
        end_line: chunk.end_line as i64,
        created_at,
        updated_at,
        score: 0.0,
    }
}

/// Index one file. A missing or blank file has its chunks removed.
///
/// Returns the number of chunks now stored for the file.
pub async fn index_file(
    path: &Path,
    root: &Path,
    store: &dyn MemoryStore,
    embedder: &dyn EmbeddingProvider,
    options: &IndexOptions,
) -> Result<usize> {
    let uri = relative_uri(root, path)?;
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            store.delete_by_uri(&uri).await?;
            return Ok(0);
        },
        Err(e) => return Err(e.into()),
    };

    let chunks = chunk_markdown(&text, &uri, options.max_chunk_tokens);
    if chunks.is_empty() {
        let removed = store.delete_by_uri(&uri).await?;
        debug!(path = %uri, removed, "blank file, nothing to index");
        return Ok(0);
    }

    let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = embed_batch_with_timeout(embedder, &contents, options.embed_timeout).await?;

    let modified: DateTime<Utc> = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let modified = modified.to_rfc3339();

    // Chunks whose lines moved get a new id; their counters follow the content.
    let mut previous: HashMap<String, ChunkRecord> = HashMap::new();
    for record in store.get_by_uri(&uri).await? {
        previous.entry(record.content_hash.clone()).or_insert(record);
    }

    let mut keep_ids = Vec::with_capacity(chunks.len());
    for (chunk, embedding) in chunks.iter().zip(&embeddings) {
        let mut record = to_record(chunk, &uri, &modified);
        if let Some(old) = previous.remove(&record.content_hash)
            && old.id != record.id
        {
            record.reinforcement = old.reinforcement;
            record.access_count = old.access_count;
            record.created_at = old.created_at;
        }
        store.upsert(&record, embedding).await?;
        keep_ids.push(record.id);
    }
    let stale = store.delete_stale(&uri, &keep_ids).await?;

    info!(path = %uri, chunks = chunks.len(), stale, "indexed file");
    Ok(chunks.len())
}

/// Index every markdown file under `root` and drop uris whose file is gone.
///
/// Returns uri → chunk count; removed files report 0.
pub async fn index_directory(
    root: &Path,
    store: &dyn MemoryStore,
    embedder: &dyn EmbeddingProvider,
    options: &IndexOptions,
) -> Result<BTreeMap<String, usize>> {
    let previous: BTreeSet<String> = store.get_all_uris().await?.into_iter().collect();
    let mut report = BTreeMap::new();
    let mut seen = BTreeSet::new();

    if root.is_dir() {
        for path in scan_markdown_files(root) {
            let uri = relative_uri(root, &path)?;
            seen.insert(uri.clone());
            match index_file(&path, root, store, embedder, options).await {
                Ok(count) => {
                    report.insert(uri, count);
                },
                Err(Error::Io(e)) => {
                    warn!(path = %uri, error = %e, "failed to index file");
                },
                Err(e) => return Err(e),
            }
        }
    } else {
        debug!(root = %root.display(), "memory root does not exist");
    }

    for uri in previous.difference(&seen) {
        let removed = store.delete_by_uri(uri).await?;
        info!(path = %uri, removed, "removed chunks of deleted file");
        report.insert(uri.clone(), 0);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::testing::{KeywordEmbedder, keyword_store},
        tempfile::TempDir,
    };

    fn write(root: &Path, rel: &str, text: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn scan_skips_hidden_generated_and_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "user/preferences.md", "- tabs");
        write(root, "journal/2024-01-01.md", "## Session 10:00");
        write(root, ".cache/notes.md", "hidden");
        write(root, "PRIMER.md", "generated");
        write(root, "TASKS.md", "generated");
        write(root, "index.db", "binary");
        write(root, "notes.markdown", "kept");

        let uris: Vec<String> = scan_markdown_files(root)
            .iter()
            .map(|p| relative_uri(root, p).unwrap())
            .collect();
        assert_eq!(uris, vec![
            "journal/2024-01-01.md",
            "notes.markdown",
            "user/preferences.md"
        ]);
    }

    #[test]
    fn uri_helpers() {
        assert_eq!(parent_dir("user/preferences.md"), "user");
        assert_eq!(parent_dir("README.md"), "");
        assert_eq!(type_from_uri("agent/decisions.md"), "decision");
        assert_eq!(type_from_uri("journal/2024-01-01.md"), "event");
        assert_eq!(type_from_uri("misc/notes.md"), "");
        assert!(matches!(
            relative_uri(Path::new("/a/b"), Path::new("/c/d.md")),
            Err(Error::OutsideMemoryRoot(_))
        ));
    }

    #[tokio::test]
    async fn index_reconciles_deleted_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let store = keyword_store().await;
        let embedder = KeywordEmbedder::new();
        let options = IndexOptions::default();

        write(root, "user/preferences.md", "- prefers rust for cli tools\n");
        let doomed = write(
            root,
            "journal/2024-01-01.md",
            "### Learned\n- sqlite fts5 search works\n",
        );
        write(root, "empty.md", "   \n");

        let report = index_directory(root, store.as_ref(), &embedder, &options)
            .await
            .unwrap();
        assert_eq!(report["user/preferences.md"], 1);
        assert_eq!(report["journal/2024-01-01.md"], 1);
        assert_eq!(report["empty.md"], 0);

        let doomed_ids: Vec<String> = store
            .fts_search("fts5", 10, &Default::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(doomed_ids.len(), 1);

        std::fs::remove_file(doomed).unwrap();
        let report = index_directory(root, store.as_ref(), &embedder, &options)
            .await
            .unwrap();
        assert_eq!(report["journal/2024-01-01.md"], 0);
        assert!(
            !store
                .get_all_uris()
                .await
                .unwrap()
                .contains(&"journal/2024-01-01.md".to_string())
        );
        for id in &doomed_ids {
            assert!(store.get_by_id(id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn reindexing_an_edited_file_leaves_no_orphans() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let store = keyword_store().await;
        let embedder = KeywordEmbedder::new();
        let options = IndexOptions::default();

        let path = write(root, "agent/decisions.md", "# A\nuse sqlite\n\n# B\nuse tokio\n");
        assert_eq!(
            index_file(&path, root, store.as_ref(), &embedder, &options)
                .await
                .unwrap(),
            2
        );

        std::fs::write(&path, "# A\nuse sqlite with wal mode\n").unwrap();
        assert_eq!(
            index_file(&path, root, store.as_ref(), &embedder, &options)
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.get_stats().await.unwrap().total_chunks, 1);
    }

    #[tokio::test]
    async fn counters_follow_content_when_lines_shift() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let store = keyword_store().await;
        let embedder = KeywordEmbedder::new();
        let options = IndexOptions::default();

        let path = write(root, "user/preferences.md", "- prefers rust for cli tools\n");
        index_file(&path, root, store.as_ref(), &embedder, &options)
            .await
            .unwrap();
        let before = store.get_by_uri("user/preferences.md").await.unwrap();
        store.increment_reinforcement(&before[0].id).await.unwrap();
        store
            .increment_access_count(std::slice::from_ref(&before[0].id))
            .await
            .unwrap();

        std::fs::write(
            &path,
            "---\ntype: preference\nreinforcement: 1\nupdated: 2024-05-01\n---\n\n- prefers rust for cli tools\n",
        )
        .unwrap();
        index_file(&path, root, store.as_ref(), &embedder, &options)
            .await
            .unwrap();

        let after = store.get_by_uri("user/preferences.md").await.unwrap();
        assert_eq!(after.len(), 1);
        assert_ne!(after[0].id, before[0].id);
        assert_eq!(after[0].reinforcement, 1);
        assert_eq!(after[0].access_count, 1);
        assert_eq!(after[0].created_at, before[0].created_at);
        assert!(store.get_by_id(&before[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_take_type_from_frontmatter_then_path() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let store = keyword_store().await;
        let embedder = KeywordEmbedder::new();

        write(
            root,
            "user/preferences.md",
            "---\ntype: preference\nimportance: 4\nupdated: 2024-03-01\n---\n\n- likes music while coding\n",
        );
        write(root, "agent/patterns.md", "- retry network calls with backoff\n");
        index_directory(root, store.as_ref(), &embedder, &IndexOptions::default())
            .await
            .unwrap();

        let hits = store
            .fts_search("music", 5, &Default::default())
            .await
            .unwrap();
        assert_eq!(hits[0].memory_type, "preference");
        assert_eq!(hits[0].importance, 4);
        assert_eq!(hits[0].parent_dir, "user");
        assert!(hits[0].updated_at.starts_with("2024-03-01"));

        let hits = store
            .fts_search("backoff", 5, &Default::default())
            .await
            .unwrap();
        assert_eq!(hits[0].memory_type, "pattern");
        assert_eq!(hits[0].importance, DEFAULT_IMPORTANCE);
    }

    #[tokio::test]
    async fn one_embedding_call_per_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let store = keyword_store().await;
        let embedder = KeywordEmbedder::new();
        let path = write(root, "notes.md", "# One\nrust\n\n# Two\npython\n\n# Three\nmusic\n");
        index_file(&path, root, store.as_ref(), &embedder, &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
