/// Memory manager: wires config, embedder, stores, retriever and writer
/// together and exposes the operations used by the CLI and the watcher.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use {
    chrono::Local,
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    config::{MemoryConfig, ensure_directories},
    embeddings::{EmbeddingProvider, create_provider},
    error::{Error, Result},
    indexer::{IndexOptions, index_directory, index_file},
    notes::split_frontmatter,
    primer::{
        Observation, SessionSummary, Task, build_primer, read_tasks, write_observation, write_primer,
        write_session, write_tasks,
    },
    privacy::PrivacyFilter,
    search::{MemorySource, Retriever, SearchResponse},
    store::{MemoryStore, StoreStats},
    store_sqlite::SqliteMemoryStore,
    writer::{WriteAction, WriteOutcome, Writer},
};

pub struct MemoryManager {
    config: MemoryConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    global: MemorySource,
    project: Option<MemorySource>,
    retriever: Retriever,
    writer: Writer,
    index_options: IndexOptions,
}

/// Per-root uri → chunk count after a full index pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub global: BTreeMap<String, usize>,
    pub project: BTreeMap<String, usize>,
}

impl IndexReport {
    pub fn total_chunks(&self) -> usize {
        self.global.values().chain(self.project.values()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RootStatus {
    pub scope: &'static str,
    pub root: PathBuf,
    #[serde(flatten)]
    pub stats: StoreStats,
}

/// Where an observation landed and what became of its insight.
#[derive(Debug, Clone, Serialize)]
pub struct ObserveOutcome {
    pub journal: PathBuf,
    /// `None` when there was no insight or it was too short to offer.
    pub insight: Option<WriteOutcome>,
}

/// Insights shorter than this stay in the journal only.
const MIN_INSIGHT_CHARS: usize = 15;

/// Status info about the memory system.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub embedding_model: String,
    pub dimension: usize,
    pub roots: Vec<RootStatus>,
}

impl MemoryManager {
    /// Create directories, the configured embedding provider and one SQLite
    /// index per memory root.
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        ensure_directories(&config)?;
        let embedder = create_provider(&config.embedding)?;
        let dimension = embedder.dimensions();

        let global_store: Arc<dyn MemoryStore> =
            Arc::new(SqliteMemoryStore::open(&config.global_index_db(), dimension).await?);
        let project_store: Option<Arc<dyn MemoryStore>> = match config.project_index_db() {
            Some(path) => Some(Arc::new(SqliteMemoryStore::open(&path, dimension).await?)),
            None => None,
        };
        info!(
            model = embedder.model_name(),
            dimension,
            project = project_store.is_some(),
            "memory manager ready"
        );
        Self::new(config, embedder, global_store, project_store)
    }

    /// Assemble a manager from existing parts. `project_store` is ignored
    /// when the config has no project root.
    pub fn new(
        config: MemoryConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        global_store: Arc<dyn MemoryStore>,
        project_store: Option<Arc<dyn MemoryStore>>,
    ) -> Result<Self> {
        let privacy = PrivacyFilter::from_config(&config.privacy)?;
        let timeout = config.embedding.timeout();

        let global = MemorySource {
            root: config.global_root.clone(),
            store: global_store,
        };
        let project = config
            .project_memory_dir()
            .zip(project_store)
            .map(|(root, store)| MemorySource { root, store });

        let mut sources: Vec<MemorySource> = project.iter().cloned().collect();
        sources.push(global.clone());
        let retriever = Retriever::new(sources, embedder.clone(), config.search.clone(), timeout);
        let writer = Writer::new(
            global.clone(),
            project.clone(),
            embedder.clone(),
            privacy,
            config.writer.clone(),
            timeout,
        );
        let index_options = IndexOptions {
            max_chunk_tokens: config.chunking.max_chunk_tokens,
            embed_timeout: timeout,
        };

        Ok(Self {
            config,
            embedder,
            global,
            project,
            retriever,
            writer,
            index_options,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Memory directories: the project's first when there is one.
    pub fn memory_roots(&self) -> Vec<PathBuf> {
        self.sources().map(|source| source.root.clone()).collect()
    }

    fn sources(&self) -> impl Iterator<Item = &MemorySource> {
        self.project.iter().chain(std::iter::once(&self.global))
    }

    fn project_dir(&self) -> Result<&Path> {
        self.project
            .as_ref()
            .map(|source| source.root.as_path())
            .ok_or(Error::NoProject)
    }

    /// Re-index every note under the global root, then the project root.
    pub async fn index_all(&self) -> Result<IndexReport> {
        let mut report = IndexReport {
            global: self.index_source(&self.global).await?,
            ..IndexReport::default()
        };
        if let Some(project) = &self.project {
            report.project = self.index_source(project).await?;
        }
        info!(chunks = report.total_chunks(), "index complete");
        Ok(report)
    }

    async fn index_source(&self, source: &MemorySource) -> Result<BTreeMap<String, usize>> {
        index_directory(
            &source.root,
            source.store.as_ref(),
            self.embedder.as_ref(),
            &self.index_options,
        )
        .await
    }

    /// Re-index (or drop, when deleted) the single file at `path`.
    pub async fn sync_path(&self, path: &Path) -> Result<usize> {
        let source = self
            .sources()
            .find(|source| path.starts_with(&source.root))
            .ok_or_else(|| Error::OutsideMemoryRoot(path.to_path_buf()))?;
        index_file(
            path,
            &source.root,
            source.store.as_ref(),
            self.embedder.as_ref(),
            &self.index_options,
        )
        .await
    }

    pub async fn search(
        &self,
        query: &str,
        scope: &str,
        max_tokens: Option<usize>,
        top_k: Option<usize>,
    ) -> Result<SearchResponse> {
        self.retriever.search(query, scope, max_tokens, top_k).await
    }

    /// Smart write. The touched file is re-indexed and the primer refreshed;
    /// failures in either only log a warning.
    pub async fn log(&self, content: &str, memory_type: Option<&str>) -> Result<WriteOutcome> {
        let outcome = self.writer.write(content, memory_type).await?;
        if outcome.action == WriteAction::Rejected {
            return Ok(outcome);
        }

        if let Some(path) = &outcome.path
            && let Err(e) = self.sync_path(path).await
        {
            warn!(path = %path.display(), error = %e, "re-index after write failed");
        }
        self.refresh_primer();
        Ok(outcome)
    }

    fn refresh_primer(&self) {
        let Some(project) = &self.project else {
            return;
        };
        let today = Local::now().date_naive();
        if let Err(e) = write_primer(&self.global.root, &project.root, &self.config.project, today)
        {
            warn!(error = %e, "primer refresh failed");
        }
    }

    /// Standing instructions followed by the context primer.
    pub fn primer(&self) -> Result<String> {
        let today = Local::now().date_naive();
        let primer = build_primer(
            &self.global.root,
            self.project.as_ref().map(|p| p.root.as_path()),
            &self.config.project,
            today,
        )?;

        let instructions = match std::fs::read_to_string(self.global.root.join("user/instructions.md"))
        {
            Ok(text) => split_frontmatter(&text).body.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if instructions.is_empty() {
            return Ok(format!("# Context\n\n{primer}"));
        }
        Ok(format!("# Instructions\n\n{instructions}\n\n# Context\n\n{primer}"))
    }

    /// Journal the session, add its next steps as pending tasks, refresh the primer.
    pub async fn session_end(&self, summary: &SessionSummary) -> Result<PathBuf> {
        let project_dir = self.project_dir()?;
        let journal = write_session(project_dir, summary, Local::now())?;

        if !summary.next_steps.is_empty() {
            let mut tasks = read_tasks(project_dir)?;
            let known: BTreeSet<String> = tasks.iter().map(|t| t.title.clone()).collect();
            let mut added = BTreeSet::new();
            for step in &summary.next_steps {
                let title = step.trim();
                if !title.is_empty() && !known.contains(title) && added.insert(title.to_string()) {
                    tasks.push(Task::pending(title));
                }
            }
            write_tasks(project_dir, &tasks)?;
        }

        if let Err(e) = self.sync_path(&journal).await {
            warn!(path = %journal.display(), error = %e, "re-index of journal failed");
        }
        self.refresh_primer();
        Ok(journal)
    }

    /// Record a coding action on today's journal; a long enough insight also
    /// goes through the smart writer.
    pub async fn observe(&self, observation: &Observation) -> Result<ObserveOutcome> {
        let project_dir = self.project_dir()?;
        let journal = write_observation(project_dir, observation, Local::now())?;
        if let Err(e) = self.sync_path(&journal).await {
            warn!(path = %journal.display(), error = %e, "re-index of journal failed");
        }

        let insight = match observation.insight() {
            Some(insight) if insight.chars().count() >= MIN_INSIGHT_CHARS => {
                Some(self.log(insight, None).await?)
            },
            _ => {
                self.refresh_primer();
                None
            },
        };
        Ok(ObserveOutcome { journal, insight })
    }

    /// Replace the task list and refresh the primer.
    pub fn update_tasks(&self, tasks: &[Task]) -> Result<PathBuf> {
        let path = write_tasks(self.project_dir()?, tasks)?;
        self.refresh_primer();
        Ok(path)
    }

    /// Raw contents of a memory file given relative to a memory root; the
    /// project root is tried first. `None` when no root has the file.
    pub fn read_file(&self, relative: &str) -> Result<Option<String>> {
        let rel = Path::new(relative);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::OutsideMemoryRoot(rel.to_path_buf()));
        }
        for source in self.sources() {
            let path = source.root.join(rel);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = %path.display(), "read memory file");
                    return Ok(Some(text));
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        let mut roots = Vec::new();
        if let Some(project) = &self.project {
            roots.push(RootStatus {
                scope: "project",
                root: project.root.clone(),
                stats: project.store.get_stats().await?,
            });
        }
        roots.push(RootStatus {
            scope: "global",
            root: self.global.root.clone(),
            stats: self.global.store.get_stats().await?,
        });
        Ok(MemoryStatus {
            embedding_model: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimensions(),
            roots,
        })
    }

    pub async fn close(&self) {
        for source in self.sources() {
            source.store.close().await;
        }
    }
}
