//! Note files: a YAML frontmatter header followed by a markdown body.
//!
//! All writes go through [`write_atomic`], so a reader never observes a
//! half-written note and a failed write leaves the previous contents intact.

use std::{io::Write, path::Path};

use serde_yaml::{Mapping, Number, Value};

use crate::error::Result;

/// Parsed frontmatter key/value block.
pub type Frontmatter = Mapping;

/// Raw pieces of a markdown document with an optional frontmatter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontmatterSplit<'a> {
    /// YAML source between the `---` delimiters, if the document has a header.
    pub yaml: Option<&'a str>,
    /// Everything after the closing delimiter line.
    pub body: &'a str,
    /// Number of lines consumed by the header (0 without one).
    pub body_line_offset: usize,
}

/// Split a leading `---` delimited block off `text` without parsing it.
pub fn split_frontmatter(text: &str) -> FrontmatterSplit<'_> {
    let no_header = FrontmatterSplit {
        yaml: None,
        body: text,
        body_line_offset: 0,
    };
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return no_header;
    };
    if first.trim_end() != "---" {
        return no_header;
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for (idx, line) in lines.enumerate() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            return FrontmatterSplit {
                yaml: Some(&text[yaml_start..offset]),
                body: &text[offset + line.len()..],
                // opening line + yaml lines + closing line
                body_line_offset: idx + 2,
            };
        }
        offset += line.len();
    }
    no_header
}

/// Parse a YAML header into a mapping. Empty headers yield an empty mapping.
pub fn parse_yaml_header(yaml: &str) -> Result<Frontmatter> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value = serde_yaml::from_str(yaml)?;
    match value {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        other => {
            let msg = format!("frontmatter must be a mapping, found {}", value_kind(&other));
            Err(<serde_yaml::Error as serde::de::Error>::custom(msg).into())
        },
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// A markdown note: frontmatter plus body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteFile {
    pub frontmatter: Frontmatter,
    pub body: String,
}

impl NoteFile {
    /// A fresh note carrying the standard header fields.
    pub fn new(memory_type: &str, importance: u8) -> Self {
        let now = today();
        let mut note = Self::default();
        note.set_str("type", memory_type);
        note.set_int("importance", i64::from(importance));
        note.set_int("reinforcement", 0);
        note.set_str("created", &now);
        note.set_str("updated", &now);
        note.set_str("status", "active");
        note
    }

    pub fn parse(text: &str) -> Result<Self> {
        let split = split_frontmatter(text);
        let frontmatter = match split.yaml {
            Some(yaml) => parse_yaml_header(yaml)?,
            None => Mapping::new(),
        };
        Ok(Self {
            frontmatter,
            body: split.body.trim_start_matches(['\r', '\n']).to_string(),
        })
    }

    /// Read a note from disk. Returns `None` if the file does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn render(&self) -> Result<String> {
        let body = self.body.trim_end();
        if self.frontmatter.is_empty() {
            return Ok(format!("{body}\n"));
        }
        let yaml = serde_yaml::to_string(&self.frontmatter)?;
        if body.is_empty() {
            Ok(format!("---\n{yaml}---\n"))
        } else {
            Ok(format!("---\n{yaml}---\n\n{body}\n"))
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.render()?)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.frontmatter.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.frontmatter.get(key).and_then(Value::as_str)
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.frontmatter
            .insert(Value::String(key.to_string()), Value::Number(Number::from(value)));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.frontmatter
            .insert(Value::String(key.to_string()), Value::String(value.to_string()));
    }

    /// Stamp the `updated` field with today's date.
    pub fn touch(&mut self) {
        self.set_str("updated", &today());
    }

    /// Bump the `reinforcement` counter by one and stamp `updated`.
    pub fn increment_reinforcement(&mut self) -> i64 {
        let next = self.get_int("reinforcement").unwrap_or(0) + 1;
        self.set_int("reinforcement", next);
        self.touch();
        next
    }

    /// Append `content` as a new bullet at the end of the body.
    pub fn append_bullet(&mut self, content: &str) {
        let mut body = self.body.trim_end().to_string();
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("- ");
        body.push_str(content.trim());
        body.push('\n');
        self.body = body;
        self.touch();
    }

    /// Replace the first bullet whose text equals `old` with `new`.
    ///
    /// Returns `false` (and leaves the note untouched) when no bullet matches.
    pub fn replace_bullet(&mut self, old: &str, new: &str) -> bool {
        let old = old.trim();
        let mut lines: Vec<String> = self.body.split('\n').map(str::to_string).collect();
        let Some(idx) = lines
            .iter()
            .position(|line| bullet_text(line).is_some_and(|text| text == old))
        else {
            return false;
        };

        let indent_len = lines[idx].len() - lines[idx].trim_start().len();
        let indent = lines[idx][..indent_len].to_string();
        lines[idx] = format!("{indent}- {}", new.trim());
        self.body = lines.join("\n");
        self.touch();
        true
    }

    /// Texts of all top-level and nested bullet items, in order.
    pub fn bullets(&self) -> Vec<String> {
        self.body
            .lines()
            .filter_map(bullet_text)
            .map(str::to_string)
            .collect()
    }
}

/// The text of a `- item` / `* item` line, or `None` for other lines.
pub fn bullet_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))?;
    Some(rest.trim())
}

/// Write `contents` to a temporary file beside `path`, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Today's local date as `YYYY-MM-DD`.
pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}
