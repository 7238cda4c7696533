//! Markdown chunker: frontmatter parsing, heading-based splitting, paragraph
//! packing for long sections, and content hashing.

use std::sync::LazyLock;

use {
    regex::Regex,
    sha2::{Digest, Sha256},
    tracing::warn,
};

use crate::notes::{self, Frontmatter};

/// Default per-chunk token budget.
pub const DEFAULT_MAX_CHUNK_TOKENS: usize = 500;

/// A contiguous excerpt of a markdown file.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    /// Logical path relative to the memory root.
    pub source: String,
    /// 1-based inclusive line range in the source file.
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
    /// Text of the nearest heading, empty for the implicit leading section.
    pub heading: String,
    pub section: Section,
    pub token_count: usize,
    /// Frontmatter of the whole file, shared by every chunk.
    pub metadata: Frontmatter,
}

impl Chunk {
    /// Deterministic id from source, position and content hash.
    pub fn chunk_id(&self) -> String {
        let raw = format!(
            "{}:{}:{}:{}",
            self.source, self.start_line, self.end_line, self.content_hash
        );
        short_sha256(&raw)
    }
}

/// Structured session-log section a chunk belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Section {
    Request,
    Learned,
    Completed,
    Next,
    #[default]
    None,
}

impl Section {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Learned => "learned",
            Self::Completed => "completed",
            Self::Next => "next",
            Self::None => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "request" => Self::Request,
            "learned" => Self::Learned,
            "completed" => Self::Completed,
            "next" => Self::Next,
            _ => Self::None,
        }
    }
}

static SECTION_PATTERNS: LazyLock<Vec<(Section, Regex)>> = LazyLock::new(|| {
    [
        (Section::Request, r"(?i)^(#{0,6}\s*)?(请求|request)"),
        (
            Section::Learned,
            r"(?i)^(#{0,6}\s*)?(学到了什么|learned|what\s+.*learned)",
        ),
        (
            Section::Completed,
            r"(?i)^(#{0,6}\s*)?(完成了什么|completed|what\s+.*completed)",
        ),
        (Section::Next, r"(?i)^(#{0,6}\s*)?(下一步|next\s*steps?)"),
    ]
    .into_iter()
    .filter_map(|(section, pattern)| Regex::new(pattern).ok().map(|re| (section, re)))
    .collect()
});

static HEADING_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").ok());

static PARAGRAPH_BREAK_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)*").ok());

/// Match heading text (leading `#` and whitespace allowed) against the
/// bilingual session-section labels.
pub fn detect_section(heading: &str) -> Section {
    let heading = heading.trim();
    SECTION_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(heading))
        .map(|(section, _)| *section)
        .unwrap_or_default()
}

fn detect_section_in_content(content: &str) -> Section {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('#'))
        .map(|line| detect_section(line.trim_start_matches('#')))
        .find(|section| *section != Section::None)
        .unwrap_or_default()
}

/// Approximate subword token count.
///
/// CJK ideographs count one token each, ASCII word runs one token per four
/// characters (minimum one), and every other visible symbol one token.
pub fn count_tokens(text: &str) -> usize {
    let mut tokens: usize = 0;
    let mut word_len: usize = 0;
    for c in text.chars() {
        if c.is_alphanumeric() && !is_cjk(c) {
            word_len += 1;
            continue;
        }
        tokens += word_len.div_ceil(4);
        word_len = 0;
        if !c.is_whitespace() {
            tokens += 1;
        }
    }
    tokens + word_len.div_ceil(4)
}

/// True for characters in the CJK unified ideographs block.
pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// SHA-256 of lowercase, whitespace-collapsed text, truncated to 16 hex chars.
pub fn content_hash(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    short_sha256(&normalized)
}

pub(crate) fn short_sha256(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(16);
    hex
}

/// A heading-delimited section before token splitting.
struct RawSection<'a> {
    content: &'a str,
    /// 1-based line of the first line of `content`.
    start_line: usize,
    end_line: usize,
    heading: String,
}

/// Split `body` into heading-delimited sections.
///
/// A heading on line 0 opens the first section; otherwise text before the
/// first heading forms a section with an empty heading. Headings inside
/// fenced code blocks are ignored.
fn split_by_headings(body: &str) -> Vec<RawSection<'_>> {
    let Some(heading_re) = HEADING_RE.as_ref() else {
        return Vec::new();
    };

    // byte offset of every line start
    let mut line_starts = vec![0];
    line_starts.extend(body.match_indices('\n').map(|(i, _)| i + 1));
    let line_count = line_starts.len();

    let mut sections = Vec::new();
    let mut current_start = 0;
    let mut current_heading = String::new();
    let mut in_fence = false;

    for i in 0..line_count {
        let line = line_at(body, &line_starts, i);
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = heading_re.captures(line.trim_end_matches('\r')) else {
            continue;
        };
        let heading = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        if i > 0 {
            sections.extend(section_between(
                body,
                &line_starts,
                current_start,
                i,
                &current_heading,
            ));
            current_start = i;
        }
        current_heading = heading;
    }
    sections.extend(section_between(
        body,
        &line_starts,
        current_start,
        line_count,
        &current_heading,
    ));

    sections
}

fn line_at<'a>(body: &'a str, line_starts: &[usize], i: usize) -> &'a str {
    let end = line_starts
        .get(i + 1)
        .map(|next| next - 1)
        .unwrap_or(body.len());
    &body[line_starts[i]..end]
}

/// Trimmed text of lines `from..to`, or `None` if it is blank.
fn section_between<'a>(
    body: &'a str,
    line_starts: &[usize],
    from: usize,
    to: usize,
    heading: &str,
) -> Option<RawSection<'a>> {
    let end_byte = line_starts.get(to).copied().unwrap_or(body.len());
    let raw = &body[line_starts[from]..end_byte];
    let content = raw.trim();
    if content.is_empty() {
        return None;
    }
    let leading = raw.len() - raw.trim_start().len();
    let start_line = from + 1 + raw[..leading].matches('\n').count();
    Some(RawSection {
        content,
        start_line,
        end_line: start_line + content.matches('\n').count(),
        heading: heading.to_string(),
    })
}

/// Greedily pack paragraphs of `content` into pieces of at most `max_tokens`.
///
/// Returns `(text, start_line, end_line)` triples; the text of each piece is
/// the original slice, so paragraph separators are preserved verbatim.
fn split_long_section(
    content: &str,
    start_line: usize,
    max_tokens: usize,
) -> Vec<(&str, usize, usize)> {
    // (start_byte, end_byte) of every paragraph
    let mut paragraphs = Vec::new();
    let mut cursor = 0;
    if let Some(re) = PARAGRAPH_BREAK_RE.as_ref() {
        for m in re.find_iter(content) {
            paragraphs.push((cursor, m.start()));
            cursor = m.end();
        }
    }
    paragraphs.push((cursor, content.len()));

    let line_of = |byte: usize| start_line + content[..byte].matches('\n').count();

    let mut pieces = Vec::new();
    let mut piece_start: Option<usize> = None;
    let mut piece_end = 0;
    let mut piece_tokens = 0;

    for (para_start, para_end) in paragraphs {
        let tokens = count_tokens(&content[para_start..para_end]);
        if let Some(start) = piece_start
            && piece_tokens + tokens > max_tokens
        {
            pieces.push((&content[start..piece_end], line_of(start), line_of(piece_end)));
            piece_start = None;
            piece_tokens = 0;
        }
        if piece_start.is_none() {
            piece_start = Some(para_start);
        }
        piece_end = para_end;
        piece_tokens += tokens;
    }
    if let Some(start) = piece_start {
        pieces.push((&content[start..piece_end], line_of(start), line_of(piece_end)));
    }
    pieces
}

/// Split markdown `text` into ordered, content-addressed chunks.
///
/// Deterministic for identical input. Frontmatter is parsed out and attached
/// to every chunk; line numbers refer to the original file, header included.
pub fn chunk_markdown(text: &str, source: &str, max_chunk_tokens: usize) -> Vec<Chunk> {
    let split = notes::split_frontmatter(text);
    let metadata = match split.yaml.map(notes::parse_yaml_header) {
        Some(Ok(map)) => map,
        Some(Err(e)) => {
            warn!(source, error = %e, "ignoring unparsable frontmatter");
            Frontmatter::new()
        },
        None => Frontmatter::new(),
    };
    let offset = split.body_line_offset;

    let mut chunks = Vec::new();
    for raw in split_by_headings(split.body) {
        let section = match detect_section(&raw.heading) {
            Section::None => detect_section_in_content(raw.content),
            found => found,
        };
        let tokens = count_tokens(raw.content);

        let pieces = if tokens <= max_chunk_tokens {
            vec![(raw.content, raw.start_line, raw.end_line)]
        } else {
            split_long_section(raw.content, raw.start_line, max_chunk_tokens)
        };

        for (content, start, end) in pieces {
            chunks.push(Chunk {
                content: content.to_string(),
                source: source.to_string(),
                start_line: start + offset,
                end_line: end + offset,
                content_hash: content_hash(content),
                heading: raw.heading.clone(),
                section,
                token_count: count_tokens(content),
                metadata: metadata.clone(),
            });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, std::collections::HashSet};

    #[test]
    fn content_hash_ignores_case_and_whitespace_runs() {
        assert_eq!(content_hash("Hello World"), content_hash("hello  world"));
        assert_eq!(content_hash("a\n\tb"), content_hash("A b"));
        assert_ne!(content_hash("Hello World"), content_hash("Goodbye World"));
        assert_eq!(content_hash("x").len(), 16);
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        assert!(chunk_markdown("", "a.md", 500).is_empty());
        assert!(chunk_markdown("  \n\n \t\n", "a.md", 500).is_empty());
        assert!(chunk_markdown("---\ntype: event\n---\n\n", "a.md", 500).is_empty());
    }

    #[test]
    fn no_headings_is_one_section() {
        let chunks = chunk_markdown("- first\n- second\n", "user/preferences.md", 500);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "- first\n- second");
        assert_eq!(chunks[0].heading, "");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
    }

    #[test]
    fn frontmatter_is_shared_and_lines_are_absolute() {
        let text = "---\ntype: preference\nimportance: 4\n---\n\n# Editor\nVim keys\n\n# Shell\nfish\n";
        let chunks = chunk_markdown(text, "user/preferences.md", 500);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            let ty = chunk.metadata.get("type").and_then(|v| v.as_str());
            assert_eq!(ty, Some("preference"));
        }
        assert_eq!(chunks[0].heading, "Editor");
        assert_eq!(chunks[0].content, "# Editor\nVim keys");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (6, 7));
        assert_eq!(chunks[1].heading, "Shell");
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (9, 10));
    }

    #[test]
    fn preamble_before_first_heading_has_empty_heading() {
        let chunks = chunk_markdown("intro line\n## Details\nmore", "notes.md", 500);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading, "");
        assert_eq!(chunks[0].content, "intro line");
        assert_eq!(chunks[1].heading, "Details");
    }

    #[test]
    fn headings_inside_code_fences_do_not_split() {
        let text = "# Setup\n```sh\n# not a heading\necho hi\n```\n";
        let chunks = chunk_markdown(text, "a.md", 500);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("# not a heading"));
    }

    #[test]
    fn structured_session_sections_are_detected() {
        let text = "## Session 10:30\n\n### 请求\nfix login\n\n### 学到了什么\n- JWT expiry\n\n### Completed\n- patched\n\n### Next Steps\n- deploy\n";
        let chunks = chunk_markdown(text, "journal/2024-01-01.md", 500);
        let sections: Vec<Section> = chunks.iter().map(|c| c.section).collect();
        assert_eq!(sections, vec![
            Section::None,
            Section::Request,
            Section::Learned,
            Section::Completed,
            Section::Next,
        ]);
    }

    #[test]
    fn detect_section_is_case_insensitive_and_bilingual() {
        assert_eq!(detect_section("### REQUEST"), Section::Request);
        assert_eq!(detect_section("What we learned"), Section::Learned);
        assert_eq!(detect_section("完成了什么"), Section::Completed);
        assert_eq!(detect_section("下一步"), Section::Next);
        assert_eq!(detect_section("next step"), Section::Next);
        assert_eq!(detect_section("Architecture"), Section::None);
    }

    #[test]
    fn section_found_inside_chunk_when_heading_is_plain() {
        assert_eq!(
            detect_section_in_content("intro\n#### learned today\n- x"),
            Section::Learned
        );
    }

    #[test]
    fn long_sections_split_at_paragraphs() {
        let para = "word ".repeat(40); // 40 tokens
        let text = format!("# Big\n{para}\n\n{para}\n\n{para}\n");
        let chunks = chunk_markdown(&text, "big.md", 90);
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.heading, "Big");
            assert!(chunk.token_count <= 90);
        }
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 4);
        assert_eq!(chunks[1].start_line, 6);
        assert_eq!(chunks[1].end_line, 6);
    }

    #[test]
    fn oversized_single_paragraph_is_kept_whole() {
        let text = "word ".repeat(100);
        let chunks = chunk_markdown(&text, "a.md", 10);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].token_count > 10);
    }

    #[test]
    fn chunk_ids_are_unique_and_stable() {
        let text = "# A\nsame\n# B\nsame\n# C\nsame\n";
        let first = chunk_markdown(text, "dup.md", 500);
        let ids: HashSet<String> = first.iter().map(Chunk::chunk_id).collect();
        assert_eq!(ids.len(), first.len());

        let second = chunk_markdown(text, "dup.md", 500);
        let again: Vec<String> = second.iter().map(Chunk::chunk_id).collect();
        let before: Vec<String> = first.iter().map(Chunk::chunk_id).collect();
        assert_eq!(before, again);
    }

    #[test]
    fn concatenated_chunks_reproduce_sections() {
        let body = "# One\nalpha\n\n## Two\nbeta\ngamma\n\n### Three\ndelta";
        let chunks = chunk_markdown(body, "r.md", 500);
        let joined: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined.join("\n\n"), body);
    }

    #[test]
    fn token_counts_are_subword_like() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("rust"), 1);
        assert_eq!(count_tokens("hello world"), 4);
        assert_eq!(count_tokens("用户偏好"), 4);
        assert_eq!(count_tokens("a, b."), 4);
    }
}
