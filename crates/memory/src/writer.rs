//! Smart write pipeline: quality gate → routing → embedding → dedup/conflict
//! check against the target file → reinforce, replace or append.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, LazyLock, Mutex, PoisonError},
    time::Duration,
};

use {
    regex::Regex,
    serde::Serialize,
    tracing::{debug, info},
};

use crate::{
    chunker::is_cjk,
    config::WriterConfig,
    embeddings::{EmbeddingProvider, cosine_similarity, embed_batch_with_timeout, embed_with_timeout},
    error::Result,
    notes::{NoteFile, bullet_text, today},
    privacy::PrivacyFilter,
    search::MemorySource,
    store::ChunkRecord,
};

/// Candidates fetched when checking for near-duplicates.
const SIMILAR_CANDIDATES: usize = 5;

// ── Quality gate ─────────────────────────────────────────────────────────────

/// Why the quality gate refused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TooShort,
    Filler,
    CodeOrPath,
    Speculative,
    Privacy,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TooShort => "too_short",
            Self::Filler => "filler",
            Self::CodeOrPath => "code_or_path",
            Self::Speculative => "speculative",
            Self::Privacy => "privacy",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

static FILLER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(?i)^(?:我来|让我|I'll|let me|I will)\s*(?:帮你|看看|help|check|look)",
        r"(?i)^(?:好的|(?:ok|okay|sure|alright|got it)\b)",
        r"(?i)^(?:当然|(?:of course|certainly)\b)",
        r"(?i)^(?:没问题|no problem\b)",
        r"(?i)^(?:这是|here is|here's|this is)\s*(?:the|a)?\s*(?:code|file|result)",
    ])
});

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"^[/\\][\w/\\.-]+$",
        r"^[\w/\\.-]+\.(?:py|js|ts|go|rs|java|cpp|c|h)$",
        r"^(?:import|require|include)\s+",
        r"^from\s+\S+\s+import\b",
        r"^\s*[\{\[\(]",
    ])
});

const SPECULATIVE_PREFIXES: [&str; 10] = [
    "可能", "也许", "或许", "大概", "probably", "maybe", "perhaps", "might be", "could be",
    "not sure",
];

/// Check whether `content` is worth remembering.
pub fn quality_gate(
    content: &str,
    privacy: Option<&PrivacyFilter>,
) -> std::result::Result<(), RejectReason> {
    let text = content.trim();

    let min_chars = if text.chars().any(is_cjk) { 10 } else { 20 };
    if text.chars().count() < min_chars {
        return Err(RejectReason::TooShort);
    }
    if FILLER_PATTERNS.iter().any(|re| re.is_match(text)) {
        return Err(RejectReason::Filler);
    }
    if CODE_PATTERNS.iter().any(|re| re.is_match(text)) {
        return Err(RejectReason::CodeOrPath);
    }
    let lower = text.to_lowercase();
    if SPECULATIVE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Err(RejectReason::Speculative);
    }
    if privacy.is_some_and(|filter| filter.contains_sensitive(text)) {
        return Err(RejectReason::Privacy);
    }
    Ok(())
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Preference,
    Instruction,
    Entity,
    Decision,
    Pattern,
    Event,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Instruction => "instruction",
            Self::Entity => "entity",
            Self::Decision => "decision",
            Self::Pattern => "pattern",
            Self::Event => "event",
        }
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preference" => Ok(Self::Preference),
            "instruction" => Ok(Self::Instruction),
            "entity" => Ok(Self::Entity),
            "decision" => Ok(Self::Decision),
            "pattern" => Ok(Self::Pattern),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a memory goes: a file relative to the global or project memory root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target_file: String,
    pub is_global: bool,
    pub memory_type: MemoryType,
    pub importance: u8,
}

/// Fixed destination for an explicit memory type. Events go to `today`'s journal.
pub fn route_by_type(memory_type: MemoryType, today: &str) -> Route {
    let (target_file, is_global, importance) = match memory_type {
        MemoryType::Preference => ("user/preferences.md".to_string(), true, 4),
        MemoryType::Instruction => ("user/instructions.md".to_string(), true, 5),
        MemoryType::Entity => ("user/entities.md".to_string(), true, 3),
        MemoryType::Decision => ("agent/decisions.md".to_string(), false, 5),
        MemoryType::Pattern => ("agent/patterns.md".to_string(), false, 3),
        MemoryType::Event => (format!("journal/{today}.md"), false, 1),
    };
    Route {
        target_file,
        is_global,
        memory_type,
        importance,
    }
}

/// Words that start sentences and are never entity names.
const NOT_NAMES: [&str; 16] = [
    "The", "This", "That", "These", "Those", "It", "There", "Here", "He", "She", "We", "They",
    "What", "Which", "Who", "Everything",
];

struct RoutingRule {
    pattern: Regex,
    memory_type: MemoryType,
    /// Capture group 1 is a proper name that must not be a common sentence opener.
    named: bool,
}

impl RoutingRule {
    fn matches(&self, text: &str) -> bool {
        if !self.named {
            return self.pattern.is_match(text);
        }
        self.pattern.captures_iter(text).any(|caps| {
            caps.get(1).is_some_and(|name| {
                let first = name.as_str().split_whitespace().next().unwrap_or("");
                !NOT_NAMES.contains(&first)
            })
        })
    }
}

/// Ordered, first match wins. Instruction/decision/pattern come before the
/// entity rules so a name-like phrase inside such a sentence does not win.
static ROUTING_RULES: LazyLock<Vec<RoutingRule>> = LazyLock::new(|| {
    [
        (
            r"(?i)(?:必须|不要|不允许|禁止|规范|规则|要求|请总是|\b(?:always|never|must)\b)",
            MemoryType::Instruction,
            false,
        ),
        (
            r"(?i)(?:决定|采用|选择了?|决策|\b(?:ADR|decided|chose|adopt(?:ed)?)\b)",
            MemoryType::Decision,
            false,
        ),
        (
            r"(?i)(?:发现|总结|规律|模式|解决方案|原因是|\b(?:patterns?|solutions?|workarounds?)\b)",
            MemoryType::Pattern,
            false,
        ),
        (
            r"(?i)(?:偏好|喜欢|习惯|\b(?:prefers?|preferred|like to|fond of|favou?rs?)\b)",
            MemoryType::Preference,
            false,
        ),
        (
            r"[一-鿿]{2,4}(?:是|担任|负责)",
            MemoryType::Entity,
            false,
        ),
        (
            r"\b([A-Z][a-z]+(?:\s[A-Z][a-z]+)?)\s+(?i:is|role is|works on|leads?|maintains?)\b",
            MemoryType::Entity,
            true,
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, memory_type, named)| {
        Regex::new(pattern).ok().map(|pattern| RoutingRule {
            pattern,
            memory_type,
            named,
        })
    })
    .collect()
});

/// Infer a destination from the wording of `content`; unmatched text is a journal event.
pub fn route_content(content: &str, today: &str) -> Route {
    let text = content.trim();
    let memory_type = ROUTING_RULES
        .iter()
        .find(|rule| rule.matches(text))
        .map(|rule| rule.memory_type)
        .unwrap_or(MemoryType::Event);
    route_by_type(memory_type, today)
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Appended,
    Reinforced,
    Replaced,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub action: WriteAction,
    /// Target file relative to its memory root; empty when rejected.
    pub target_file: String,
    pub reason: String,
    pub memory_type: String,
    /// Absolute path of the touched file.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    /// Whether the touched file lives under the global root.
    #[serde(skip)]
    pub is_global: bool,
}

impl WriteOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            action: WriteAction::Rejected,
            target_file: String::new(),
            reason: reason.as_str().to_string(),
            memory_type: String::new(),
            path: None,
            is_global: false,
        }
    }
}

pub struct Writer {
    global: MemorySource,
    project: Option<MemorySource>,
    embedder: Arc<dyn EmbeddingProvider>,
    privacy: PrivacyFilter,
    config: WriterConfig,
    embed_timeout: Duration,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Writer {
    /// `project.root` is the project's memory directory, not the repository root.
    pub fn new(
        global: MemorySource,
        project: Option<MemorySource>,
        embedder: Arc<dyn EmbeddingProvider>,
        privacy: PrivacyFilter,
        config: WriterConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            global,
            project,
            embedder,
            privacy,
            config,
            embed_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Project-scoped routes fall back to the global root outside a project.
    fn source_for(&self, route: &Route) -> (&MemorySource, bool) {
        match (&self.project, route.is_global) {
            (Some(project), false) => (project, false),
            _ => (&self.global, true),
        }
    }

    /// Run the full pipeline for one piece of content.
    ///
    /// `memory_type` overrides routing; an unrecognised type is logged as an event.
    pub async fn write(&self, content: &str, memory_type: Option<&str>) -> Result<WriteOutcome> {
        if let Err(reason) = quality_gate(content.trim(), Some(&self.privacy)) {
            info!(%reason, "quality gate rejected memory");
            return Ok(WriteOutcome::rejected(reason));
        }
        let content = content.split_whitespace().collect::<Vec<_>>().join(" ");

        let today = today();
        let route = match memory_type.map(str::parse::<MemoryType>) {
            Some(Ok(explicit)) => route_by_type(explicit, &today),
            Some(Err(e)) => {
                debug!(error = %e, "falling back to event");
                route_by_type(MemoryType::Event, &today)
            },
            None => route_content(&content, &today),
        };
        let (source, is_global) = self.source_for(&route);
        let path = source.root.join(&route.target_file);

        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let embedding =
            embed_with_timeout(self.embedder.as_ref(), &content, self.embed_timeout).await?;
        let similar = source
            .store
            .find_similar(
                &embedding,
                Some(route.target_file.as_str()),
                self.config.conflict_threshold,
                SIMILAR_CANDIDATES,
            )
            .await?;

        let outcome = |action: WriteAction, reason: String| WriteOutcome {
            action,
            target_file: route.target_file.clone(),
            reason,
            memory_type: route.memory_type.as_str().to_string(),
            path: Some(path.clone()),
            is_global,
        };

        if let Some(best) = similar.first() {
            let reason = format!("score={:.2}", best.score);
            if best.score >= self.config.reinforce_threshold {
                source.store.increment_reinforcement(&best.id).await?;
                if let Some(mut note) = NoteFile::read(&path)? {
                    note.increment_reinforcement();
                    note.write(&path)?;
                }
                info!(file = %route.target_file, score = best.score, "reinforced existing memory");
                return Ok(outcome(WriteAction::Reinforced, reason));
            }

            if let Some(old) = self.matching_bullet(best, &embedding).await?
                && let Some(mut note) = NoteFile::read(&path)?
                && note.replace_bullet(&old, &content)
            {
                note.write(&path)?;
                info!(file = %route.target_file, score = best.score, "replaced conflicting memory");
                return Ok(outcome(WriteAction::Replaced, reason));
            }
            debug!(file = %route.target_file, "conflicting bullet not found, appending");
        }

        let mut note = match NoteFile::read(&path)? {
            Some(note) => note,
            None => NoteFile::new(route.memory_type.as_str(), route.importance),
        };
        note.append_bullet(&content);
        note.write(&path)?;
        info!(file = %route.target_file, "appended new memory");
        Ok(outcome(WriteAction::Appended, String::new()))
    }

    /// The bullet inside `record` that the new content supersedes.
    async fn matching_bullet(&self, record: &ChunkRecord, embedding: &[f32]) -> Result<Option<String>> {
        let bullets: Vec<String> = record
            .content
            .lines()
            .filter_map(bullet_text)
            .map(str::to_string)
            .collect();
        match bullets.len() {
            0 => Ok(None),
            1 => Ok(bullets.into_iter().next()),
            _ => {
                let vectors =
                    embed_batch_with_timeout(self.embedder.as_ref(), &bullets, self.embed_timeout)
                        .await?;
                Ok(bullets
                    .into_iter()
                    .zip(vectors)
                    .map(|(bullet, v)| (bullet, cosine_similarity(embedding, &v)))
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(bullet, _)| bullet))
            },
        }
    }
}
