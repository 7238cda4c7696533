//! Retrieval: fast-path file reads, journal timeline, and hybrid vector + FTS
//! search fused with RRF and reranked by salience under a token budget.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    path::PathBuf,
    sync::{Arc, LazyLock},
    time::Duration,
};

use {
    chrono::{DateTime, NaiveDate, NaiveDateTime, Utc},
    regex::Regex,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    chunker::count_tokens,
    config::SearchConfig,
    embeddings::{EmbeddingProvider, embed_with_timeout},
    error::Result,
    store::{ChunkRecord, MemoryStore, SearchFilter},
};

/// RRF damping constant.
pub const RRF_K: f64 = 60.0;
/// Journal files read by a timeline query.
pub const TIMELINE_DAYS: usize = 7;

const FAST_PATH_ID: &str = "fast-path";
const TIMELINE_ID: &str = "timeline";

static FAST_PATH_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)(偏好|preference|喜欢什么|习惯)", "user/preferences.md"),
        (r"(?i)(指令|规则|规范|instruction|rule)", "user/instructions.md"),
        (r"(?i)(任务|进度|task|todo|待办)", "TASKS.md"),
        (r"(?i)(谁是|负责人|团队|成员|entity|people)", "user/entities.md"),
        (r"(?i)(决策|决定|ADR|decision)", "agent/decisions.md"),
        (r"(?i)(模式|方案|pattern|solution)", "agent/patterns.md"),
    ]
    .into_iter()
    .filter_map(|(pattern, path)| Regex::new(pattern).ok().map(|re| (re, path)))
    .collect()
});

static TIMELINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(最近|近期|这几天|today|recent|past\s*\d+\s*days?)",
        r"(?i)(上周|上个星期|last\s*week)",
        r"(?i)(昨天|yesterday|前天)",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Canonical file a query should be answered from wholesale, if any.
pub fn fast_path_target(query: &str) -> Option<&'static str> {
    FAST_PATH_RULES
        .iter()
        .find(|(re, _)| re.is_match(query))
        .map(|(_, path)| *path)
}

pub fn is_timeline_query(query: &str) -> bool {
    TIMELINE_PATTERNS.iter().any(|re| re.is_match(query))
}

// ── Salience ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SalienceWeights {
    pub semantic: f64,
    pub reinforcement: f64,
    pub recency: f64,
    pub access: f64,
}

impl Default for SalienceWeights {
    fn default() -> Self {
        Self {
            semantic: 0.50,
            reinforcement: 0.20,
            recency: 0.20,
            access: 0.10,
        }
    }
}

impl From<&SearchConfig> for SalienceWeights {
    fn from(config: &SearchConfig) -> Self {
        Self {
            semantic: config.w_semantic,
            reinforcement: config.w_reinforcement,
            recency: config.w_recency,
            access: config.w_access,
        }
    }
}

/// Per-candidate signals fed into [`SalienceModel::score`].
#[derive(Debug, Clone, Copy)]
pub struct SalienceInput<'a> {
    /// Relevance in `[0, 1]`.
    pub semantic: f64,
    pub reinforcement: i64,
    pub max_reinforcement: i64,
    pub access_count: i64,
    pub max_access: i64,
    pub updated_at: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct SalienceModel {
    pub weights: SalienceWeights,
    pub half_life_days: f64,
}

impl SalienceModel {
    pub fn score(&self, input: &SalienceInput<'_>, now: DateTime<Utc>) -> f64 {
        let w = &self.weights;
        w.semantic * input.semantic.clamp(0.0, 1.0)
            + w.reinforcement * log_normalize(input.reinforcement, input.max_reinforcement)
            + w.recency * recency_score(input.updated_at, self.half_life_days, now)
            + w.access * log_normalize(input.access_count, input.max_access)
    }
}

/// `ln(value + 1) / ln(max + 2)`, 0 when `max` is 0.
pub fn log_normalize(value: i64, max: i64) -> f64 {
    if max <= 0 {
        return 0.0;
    }
    let value = value.clamp(0, max) as f64;
    (value + 1.0).ln() / (max as f64 + 2.0).ln()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Exponential half-life decay on the age of `updated_at`; 0.5 if unparsable.
pub fn recency_score(updated_at: &str, half_life_days: f64, now: DateTime<Utc>) -> f64 {
    let Some(updated) = parse_timestamp(updated_at) else {
        return 0.5;
    };
    let age_days = ((now - updated).num_seconds() as f64 / 86_400.0).max(0.0);
    let lambda = std::f64::consts::LN_2 / half_life_days.max(f64::EPSILON);
    (-lambda * age_days).exp()
}

// ── Fusion ───────────────────────────────────────────────────────────────────

/// Reciprocal Rank Fusion: every item at rank `r` in a list adds `1 / (k + r + 1)`.
///
/// The first occurrence of a key is the one kept. Output is sorted by fused
/// score, ties in first-seen order.
pub fn rrf_merge<T, K, F>(lists: Vec<Vec<T>>, k: f64, key: F) -> Vec<(T, f64)>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut fused: Vec<(T, f64)> = Vec::new();
    for list in lists {
        for (rank, item) in list.into_iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);
            let item_key = key(&item);
            match positions.get(&item_key) {
                Some(&pos) => fused[pos].1 += contribution,
                None => {
                    positions.insert(item_key, fused.len());
                    fused.push((item, contribution));
                },
            }
        }
    }
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    FastPath,
    Timeline,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub uri: String,
    pub chunk_id: String,
    pub salience: f64,
    pub semantic_score: f64,
    pub reinforcement: i64,
    pub token_count: usize,
    pub memory_type: String,
    pub section: String,
    #[serde(skip)]
    source: usize,
}

impl SearchResult {
    fn whole_file(content: String, uri: String, chunk_id: &str) -> Self {
        Self {
            token_count: count_tokens(&content),
            content,
            uri,
            chunk_id: chunk_id.to_string(),
            salience: 1.0,
            semantic_score: 1.0,
            reinforcement: 0,
            memory_type: String::new(),
            section: String::new(),
            source: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub strategy: SearchStrategy,
    pub results: Vec<SearchResult>,
    pub total_tokens: usize,
    pub budget_remaining: usize,
}

/// Accept results in order while the running token total fits `max_tokens`
/// and the count stays within `top_k`. Stops at the first overflow.
pub fn apply_budget(
    ranked: Vec<SearchResult>,
    max_tokens: usize,
    top_k: usize,
) -> (Vec<SearchResult>, usize) {
    let mut accepted = Vec::new();
    let mut total = 0;
    for result in ranked {
        if accepted.len() >= top_k || total + result.token_count > max_tokens {
            break;
        }
        total += result.token_count;
        accepted.push(result);
    }
    (accepted, total)
}

// ── Retriever ────────────────────────────────────────────────────────────────

/// A memory root and the store indexing it.
#[derive(Clone)]
pub struct MemorySource {
    pub root: PathBuf,
    pub store: Arc<dyn MemoryStore>,
}

pub struct Retriever {
    sources: Vec<MemorySource>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
    embed_timeout: Duration,
}

impl Retriever {
    /// `sources` are consulted in order; the first root holding a fast-path file wins.
    pub fn new(
        sources: Vec<MemorySource>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: SearchConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            sources,
            embedder,
            config,
            embed_timeout,
        }
    }

    fn model(&self) -> SalienceModel {
        SalienceModel {
            weights: SalienceWeights::from(&self.config),
            half_life_days: self.config.recency_half_life_days,
        }
    }

    /// Tiered search. `max_tokens` / `top_k` fall back to the configured defaults.
    pub async fn search(
        &self,
        query: &str,
        scope: &str,
        max_tokens: Option<usize>,
        top_k: Option<usize>,
    ) -> Result<SearchResponse> {
        let budget = max_tokens.unwrap_or(self.config.default_max_tokens);
        let top_k = top_k.unwrap_or(self.config.default_top_k);

        if let Some(response) = self.try_fast_path(query, budget).await? {
            return Ok(response);
        }
        if is_timeline_query(query)
            && let Some(response) = self.try_timeline(query, budget).await?
        {
            return Ok(response);
        }

        let ranked = self.rank(query, scope, top_k).await?;
        let (results, total_tokens) = apply_budget(ranked, budget, top_k);

        let mut accessed: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for result in &results {
            accessed
                .entry(result.source)
                .or_default()
                .push(result.chunk_id.clone());
        }
        for (source, ids) in accessed {
            if let Some(src) = self.sources.get(source) {
                src.store.increment_access_count(&ids).await?;
            }
        }

        debug!(%query, results = results.len(), total_tokens, "hybrid search");
        Ok(SearchResponse {
            query: query.to_string(),
            strategy: SearchStrategy::Hybrid,
            results,
            total_tokens,
            budget_remaining: budget.saturating_sub(total_tokens),
        })
    }

    async fn try_fast_path(&self, query: &str, budget: usize) -> Result<Option<SearchResponse>> {
        let Some(rel) = fast_path_target(query) else {
            return Ok(None);
        };
        for source in &self.sources {
            let path = source.root.join(rel);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let result = SearchResult::whole_file(content, rel.to_string(), FAST_PATH_ID);
                    let total_tokens = result.token_count;
                    debug!(%query, path = %rel, "fast path hit");
                    return Ok(Some(SearchResponse {
                        query: query.to_string(),
                        strategy: SearchStrategy::FastPath,
                        results: vec![result],
                        total_tokens,
                        budget_remaining: budget.saturating_sub(total_tokens),
                    }));
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Most recent journal files, newest first, within the budget.
    /// `None` when no journal exists so the caller can fall back to search.
    async fn try_timeline(&self, query: &str, budget: usize) -> Result<Option<SearchResponse>> {
        let mut results = Vec::new();
        let mut total_tokens = 0;
        let mut found_any = false;

        'roots: for source in &self.sources {
            let journal_dir = source.root.join("journal");
            let mut entries = match tokio::fs::read_dir(&journal_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".md") && entry.file_type().await?.is_file() {
                    names.push(name);
                }
            }
            names.sort_by(|a, b| b.cmp(a));
            names.truncate(TIMELINE_DAYS);
            found_any |= !names.is_empty();

            for name in names {
                let content = match tokio::fs::read_to_string(journal_dir.join(&name)).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(file = %name, error = %e, "failed to read journal file");
                        continue;
                    },
                };
                let result =
                    SearchResult::whole_file(content, format!("journal/{name}"), TIMELINE_ID);
                if total_tokens + result.token_count > budget {
                    break 'roots;
                }
                total_tokens += result.token_count;
                results.push(result);
            }
        }

        if !found_any {
            return Ok(None);
        }
        Ok(Some(SearchResponse {
            query: query.to_string(),
            strategy: SearchStrategy::Timeline,
            results,
            total_tokens,
            budget_remaining: budget.saturating_sub(total_tokens),
        }))
    }

    /// Every hybrid candidate sorted by salience, without budget or side effects.
    pub async fn rank(&self, query: &str, scope: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        if top_k == 0 || self.sources.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = embed_with_timeout(self.embedder.as_ref(), query, self.embed_timeout).await?;
        let filter = SearchFilter::for_scope(scope);
        let fetch = top_k.saturating_mul(2);

        let mut vector_hits: Vec<(usize, ChunkRecord)> = Vec::new();
        let mut fts_hits: Vec<(usize, ChunkRecord)> = Vec::new();
        let mut max_reinforcement = 0;
        let mut max_access = 0;
        for (idx, source) in self.sources.iter().enumerate() {
            let (vector, fts, reinf, access) = tokio::join!(
                source.store.vector_search(&embedding, fetch, &filter),
                source.store.fts_search(query, fetch, &filter),
                source.store.get_max_reinforcement(),
                source.store.get_max_access_count(),
            );
            vector_hits.extend(vector?.into_iter().map(|r| (idx, r)));
            fts_hits.extend(fts?.into_iter().map(|r| (idx, r)));
            max_reinforcement = max_reinforcement.max(reinf?);
            max_access = max_access.max(access?);
        }
        for hits in [&mut vector_hits, &mut fts_hits] {
            hits.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
            hits.truncate(fetch);
        }

        // Fused scores are rescaled so a top hit in every list maps to 1.0.
        let lists = vec![vector_hits, fts_hits];
        let best_possible = lists.len() as f64 / (RRF_K + 1.0);
        let fused = rrf_merge(lists, RRF_K, |(idx, r)| (*idx, r.id.clone()));

        let model = self.model();
        let now = Utc::now();
        let mut ranked: Vec<SearchResult> = fused
            .into_iter()
            .map(|((source, record), fused_score)| {
                let semantic = (fused_score / best_possible).clamp(0.0, 1.0);
                let salience = model.score(
                    &SalienceInput {
                        semantic,
                        reinforcement: record.reinforcement,
                        max_reinforcement,
                        access_count: record.access_count,
                        max_access,
                        updated_at: &record.updated_at,
                    },
                    now,
                );
                SearchResult {
                    salience,
                    semantic_score: semantic,
                    reinforcement: record.reinforcement,
                    token_count: usize::try_from(record.token_count).unwrap_or(0),
                    chunk_id: record.id,
                    uri: record.uri,
                    content: record.content,
                    memory_type: record.memory_type,
                    section: record.section,
                    source,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.salience.total_cmp(&a.salience));
        Ok(ranked)
    }
}
