use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::Deserialize,
    toml::{Table, Value},
    tracing::debug,
};

use crate::error::{Error, Result};

/// Name of the per-project memory directory and of the global root.
pub const MEMORY_DIR_NAME: &str = ".openclaw_memory";
/// Per-project config file, looked up at the project root or inside the memory dir.
pub const PROJECT_CONFIG_FILE: &str = ".openclaw_memory.toml";
/// Prefix of environment variable overrides: `OPENCLAW_<SECTION>_<FIELD>`.
pub const ENV_PREFIX: &str = "OPENCLAW_";

/// Resolved configuration for the memory subsystem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub project: ProjectMeta,
    pub embedding: EmbeddingConfig,
    pub privacy: PrivacyConfig,
    pub search: SearchConfig,
    pub writer: WriterConfig,
    pub chunking: ChunkingConfig,
    /// Root of the cross-project memory (`~/.openclaw_memory`).
    #[serde(skip)]
    pub global_root: PathBuf,
    /// Detected project directory, `None` outside a project.
    #[serde(skip)]
    pub project_root: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            project: ProjectMeta::default(),
            embedding: EmbeddingConfig::default(),
            privacy: PrivacyConfig::default(),
            search: SearchConfig::default(),
            writer: WriterConfig::default(),
            chunking: ChunkingConfig::default(),
            global_root: default_global_root(),
            project_root: None,
        }
    }
}

impl MemoryConfig {
    pub fn global_user_dir(&self) -> PathBuf {
        self.global_root.join("user")
    }

    pub fn global_index_db(&self) -> PathBuf {
        self.global_root.join("index.db")
    }

    pub fn project_memory_dir(&self) -> Option<PathBuf> {
        self.project_root
            .as_ref()
            .map(|root| root.join(MEMORY_DIR_NAME))
    }

    pub fn project_index_db(&self) -> Option<PathBuf> {
        self.project_memory_dir().map(|dir| dir.join("index.db"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectMeta {
    pub name: String,
    pub description: String,
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/v1/embeddings` API.
    OpenAi,
    /// Local Ollama service.
    #[default]
    Ollama,
    /// Offline model (requires the `local-embeddings` feature).
    Local,
}

impl EmbeddingProviderKind {
    /// Default `(model, dimension)` for the backend.
    pub fn defaults(self) -> (&'static str, usize) {
        match self {
            Self::OpenAi => ("text-embedding-3-small", 1536),
            Self::Ollama => ("nomic-embed-text", 768),
            Self::Local => ("all-MiniLM-L6-v2", 384),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    /// Empty means the provider default.
    pub model: String,
    pub api_key: Option<String>,
    /// Empty means the provider default.
    pub base_url: String,
    /// 0 means the provider default.
    pub dimension: usize,
    /// Upper bound for a single embedding call.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            model: String::new(),
            api_key: None,
            base_url: String::new(),
            dimension: 0,
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("dimension", &self.dimension)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EmbeddingConfig {
    pub fn resolved_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.defaults().0
        } else {
            &self.model
        }
    }

    pub fn resolved_dimension(&self) -> usize {
        if self.dimension == 0 {
            self.provider.defaults().1
        } else {
            self.dimension
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enabled: bool,
    pub patterns: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: [
                r"sk-[a-zA-Z0-9]{20,}",
                r"ghp_[a-zA-Z0-9]{36}",
                r"password\s*[:=]\s*\S+",
                r"secret\s*[:=]\s*\S+",
                r"192\.168\.\d+\.\d+",
                r"10\.\d+\.\d+\.\d+",
                r"localhost:\d+",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_max_tokens: usize,
    pub recency_half_life_days: f64,
    pub default_top_k: usize,
    pub w_semantic: f64,
    pub w_reinforcement: f64,
    pub w_recency: f64,
    pub w_access: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 1500,
            recency_half_life_days: 30.0,
            default_top_k: 10,
            w_semantic: 0.50,
            w_reinforcement: 0.20,
            w_recency: 0.20,
            w_access: 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Similarity at or above which a write reinforces an existing memory.
    pub reinforce_threshold: f64,
    /// Similarity at or above which a write replaces an existing memory.
    pub conflict_threshold: f64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            reinforce_threshold: 0.92,
            conflict_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: crate::chunker::DEFAULT_MAX_CHUNK_TOKENS,
        }
    }
}

/// `~/.openclaw_memory`, or `./.openclaw_memory` when no home directory is known.
pub fn default_global_root() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(MEMORY_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(MEMORY_DIR_NAME))
}

/// Load configuration for `cwd` using the process environment.
///
/// Priority, lowest first: built-in defaults, `<global_root>/config.toml`,
/// the project's `.openclaw_memory.toml`, `OPENCLAW_*` environment variables.
pub fn load_config(cwd: &Path, global_root: Option<PathBuf>) -> Result<MemoryConfig> {
    let global_root = global_root.unwrap_or_else(default_global_root);
    let project_root = detect_project_root(cwd);
    load_config_from(global_root, project_root, std::env::vars())
}

/// Same as [`load_config`] with explicit roots and environment.
pub fn load_config_from(
    global_root: PathBuf,
    project_root: Option<PathBuf>,
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<MemoryConfig> {
    let env: Vec<(String, String)> = env.into_iter().collect();

    let mut merged = read_toml(&global_root.join("config.toml"))?;
    if let Some(project) = &project_root {
        let mut project_cfg = read_toml(&project.join(PROJECT_CONFIG_FILE))?;
        if project_cfg.is_empty() {
            project_cfg = read_toml(&project.join(MEMORY_DIR_NAME).join(PROJECT_CONFIG_FILE))?;
        }
        deep_merge(&mut merged, project_cfg);
    }
    apply_env_overrides(&mut merged, &env);

    let mut config: MemoryConfig = Value::Table(merged)
        .try_into()
        .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;

    if config.embedding.api_key.as_deref().is_none_or(str::is_empty) {
        config.embedding.api_key = env
            .iter()
            .find(|(key, value)| key == "OPENAI_API_KEY" && !value.is_empty())
            .map(|(_, value)| value.clone());
    }
    config.global_root = global_root;
    config.project_root = project_root;
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn read_toml(path: &Path) -> Result<Table> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .parse::<Table>()
            .map_err(|e| Error::config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively merge `overlay` into `base`; overlay scalars win.
fn deep_merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match value {
            Value::Table(over) => match base.get_mut(&key) {
                Some(Value::Table(existing)) => deep_merge(existing, over),
                _ => {
                    base.insert(key, Value::Table(over));
                },
            },
            other => {
                base.insert(key, other);
            },
        }
    }
}

/// Apply `OPENCLAW_<SECTION>_<FIELD>=value` pairs onto the merged table.
fn apply_env_overrides(table: &mut Table, env: &[(String, String)]) {
    for (key, raw) in env {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let name = name.to_lowercase();
        let value = parse_env_value(raw);
        match name.split_once('_') {
            Some((section, field)) => {
                let entry = table
                    .entry(section.to_string())
                    .or_insert_with(|| Value::Table(Table::new()));
                if !entry.is_table() {
                    *entry = Value::Table(Table::new());
                }
                if let Value::Table(section_table) = entry {
                    section_table.insert(field.to_string(), value);
                }
            },
            None => {
                table.insert(name, value);
            },
        }
    }
}

/// Interpret an env value as a TOML literal (number, bool, array) or a string.
fn parse_env_value(raw: &str) -> Value {
    format!("v = {raw}")
        .parse::<Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .filter(|v| !v.is_datetime())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

/// Walk up from `cwd` for a project config, falling back to the nearest git root.
pub fn detect_project_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|dir| {
            dir.join(PROJECT_CONFIG_FILE).is_file()
                || dir.join(MEMORY_DIR_NAME).join(PROJECT_CONFIG_FILE).is_file()
        })
        .or_else(|| cwd.ancestors().find(|dir| dir.join(".git").exists()))
        .map(Path::to_path_buf)
}

/// Create the memory directory skeleton for the configured roots.
pub fn ensure_directories(config: &MemoryConfig) -> Result<()> {
    std::fs::create_dir_all(config.global_user_dir())?;
    if let Some(dir) = config.project_memory_dir() {
        std::fs::create_dir_all(dir.join("journal"))?;
        std::fs::create_dir_all(dir.join("agent"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, tempfile::TempDir};

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn defaults_without_files() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config_from(tmp.path().to_path_buf(), None, no_env()).unwrap();
        assert_eq!(cfg.search.default_max_tokens, 1500);
        assert_eq!(cfg.search.default_top_k, 10);
        assert!((cfg.writer.reinforce_threshold - 0.92).abs() < 1e-9);
        assert_eq!(cfg.embedding.provider, EmbeddingProviderKind::Ollama);
        assert_eq!(cfg.embedding.resolved_dimension(), 768);
        assert!(cfg.privacy.enabled);
        assert_eq!(cfg.chunking.max_chunk_tokens, 500);
    }

    #[test]
    fn project_overrides_global_and_env_overrides_both() {
        let tmp = TempDir::new().unwrap();
        let global = tmp.path().join("global");
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&global).unwrap();
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            global.join("config.toml"),
            "[embedding]\nprovider = \"openai\"\nmodel = \"m-global\"\n[search]\ndefault_top_k = 3\n",
        )
        .unwrap();
        std::fs::write(
            project.join(PROJECT_CONFIG_FILE),
            "[project]\nname = \"demo\"\n[embedding]\nmodel = \"m-project\"\n",
        )
        .unwrap();

        let env = vec![
            ("OPENCLAW_SEARCH_DEFAULT_MAX_TOKENS".to_string(), "800".to_string()),
            ("OPENCLAW_PRIVACY_ENABLED".to_string(), "false".to_string()),
            ("OPENAI_API_KEY".to_string(), "sk-from-env".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let cfg = load_config_from(global, Some(project.clone()), env).unwrap();

        assert_eq!(cfg.embedding.provider, EmbeddingProviderKind::OpenAi);
        assert_eq!(cfg.embedding.resolved_model(), "m-project");
        assert_eq!(cfg.embedding.resolved_dimension(), 1536);
        assert_eq!(cfg.search.default_top_k, 3);
        assert_eq!(cfg.search.default_max_tokens, 800);
        assert!(!cfg.privacy.enabled);
        assert_eq!(cfg.project.name, "demo");
        assert_eq!(cfg.embedding.api_key.as_deref(), Some("sk-from-env"));
        assert_eq!(
            cfg.project_index_db(),
            Some(project.join(MEMORY_DIR_NAME).join("index.db"))
        );
    }

    #[test]
    fn api_key_is_redacted_in_debug_output() {
        let cfg = EmbeddingConfig {
            api_key: Some("sk-supersecret".into()),
            ..EmbeddingConfig::default()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "[search\n").unwrap();
        let err = load_config_from(tmp.path().to_path_buf(), None, no_env()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let env = vec![("OPENCLAW_EMBEDDING_PROVIDER".to_string(), "cohere".to_string())];
        let err = load_config_from(tmp.path().to_path_buf(), None, env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_values_are_typed() {
        assert_eq!(parse_env_value("42"), Value::Integer(42));
        assert_eq!(parse_env_value("true"), Value::Boolean(true));
        assert_eq!(parse_env_value("ollama"), Value::String("ollama".into()));
        assert_eq!(
            parse_env_value("http://localhost:11434"),
            Value::String("http://localhost:11434".into())
        );
        assert!(parse_env_value("[\"a\", \"b\"]").is_array());
    }

    #[test]
    fn project_root_found_by_config_file_or_git() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("proj");
        let nested = project.join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(project.join(".git")).unwrap();
        assert_eq!(detect_project_root(&nested), Some(project.clone()));

        std::fs::write(project.join("src").join(PROJECT_CONFIG_FILE), "").unwrap();
        assert_eq!(detect_project_root(&nested), Some(project.join("src")));
    }

    #[test]
    fn ensure_directories_builds_layout() {
        let tmp = TempDir::new().unwrap();
        let cfg = MemoryConfig {
            global_root: tmp.path().join("global"),
            project_root: Some(tmp.path().join("proj")),
            ..MemoryConfig::default()
        };
        ensure_directories(&cfg).unwrap();
        assert!(tmp.path().join("global/user").is_dir());
        assert!(tmp.path().join("proj/.openclaw_memory/journal").is_dir());
        assert!(tmp.path().join("proj/.openclaw_memory/agent").is_dir());
    }
}
