//! Project-level generated files: the session primer, session journal blocks
//! and the task list.

use std::path::{Path, PathBuf};

use {
    chrono::{DateTime, Days, Local, NaiveDate},
    serde::{Deserialize, Serialize},
    tracing::info,
};

use crate::{
    config::ProjectMeta,
    error::{Error, Result},
    notes::{NoteFile, split_frontmatter, write_atomic},
};

pub const PRIMER_FILE: &str = "PRIMER.md";
pub const TASKS_FILE: &str = "TASKS.md";

/// Journal days scanned for completed work.
const RECENT_DAYS: u64 = 3;
const MAX_RECENT_ENTRIES: usize = 10;
const MAX_ITEMS: usize = 5;
const NOTHING_RECORDED: &str = "(nothing recorded yet)";
const NO_TASKS: &str = "(no tasks)";

const COMPLETED_HEADINGS: [&str; 2] = ["### completed", "### 完成了什么"];

// ── Primer ───────────────────────────────────────────────────────────────────

/// Last `max` bullets of a note, most recent last.
fn last_items(path: &Path, max: usize) -> Result<Vec<String>> {
    let Some(note) = NoteFile::read(path)? else {
        return Ok(Vec::new());
    };
    let items = note.bullets();
    let skip = items.len().saturating_sub(max);
    Ok(items.into_iter().skip(skip).collect())
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Items under "Completed" headings in the journals of the last few days,
/// prefixed with their date and session.
fn recent_completed(journal_dir: &Path, today: NaiveDate) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for offset in 0..RECENT_DAYS {
        let Some(day) = today.checked_sub_days(Days::new(offset)) else {
            break;
        };
        let date = day.format("%Y-%m-%d").to_string();
        let text = match std::fs::read_to_string(journal_dir.join(format!("{date}.md"))) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        let mut session = "";
        let mut in_completed = false;
        for line in text.lines() {
            let stripped = line.trim();
            if let Some(rest) = stripped.strip_prefix("## ")
                && rest.to_lowercase().starts_with("session")
            {
                session = rest.trim();
                in_completed = false;
                continue;
            }
            if stripped.starts_with("###") {
                let lower = stripped.to_lowercase();
                in_completed = COMPLETED_HEADINGS.iter().any(|h| lower.starts_with(h));
                continue;
            }
            if in_completed && let Some(item) = stripped.strip_prefix("- ") {
                let prefix = if session.is_empty() {
                    date.clone()
                } else {
                    format!("{date} {session}")
                };
                entries.push(format!("{prefix}: {}", item.trim()));
            }
        }
    }
    entries.truncate(MAX_RECENT_ENTRIES);
    Ok(entries)
}

fn tasks_body(project_dir: &Path) -> Result<String> {
    match std::fs::read_to_string(project_dir.join(TASKS_FILE)) {
        Ok(text) => {
            let body = split_frontmatter(&text).body.trim().to_string();
            Ok(if body.is_empty() { NO_TASKS.to_string() } else { body })
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NO_TASKS.to_string()),
        Err(e) => Err(e.into()),
    }
}

/// Assemble the primer markdown from note files. No model calls are involved.
///
/// `project_dir` is the project's memory directory; without one, the recent
/// context and task sections are empty.
pub fn build_primer(
    global_root: &Path,
    project_dir: Option<&Path>,
    project: &ProjectMeta,
    today: NaiveDate,
) -> Result<String> {
    let entities = last_items(&global_root.join("user/entities.md"), MAX_ITEMS)?;
    let preferences = last_items(&global_root.join("user/preferences.md"), MAX_ITEMS)?;

    let project_info = match (project.name.trim(), project.description.trim()) {
        ("", _) => NOTHING_RECORDED.to_string(),
        (name, "") => format!("- {name}"),
        (name, description) => format!("- {name} | {description}"),
    };

    let (recent, tasks) = match project_dir {
        Some(dir) => (recent_completed(&dir.join("journal"), today)?, tasks_body(dir)?),
        None => (Vec::new(), NO_TASKS.to_string()),
    };

    let primer = format!(
        "## User\n{}\n\n## Project\n{project_info}\n\n## Preferences\n{}\n\n\
         ## Recent context (last {RECENT_DAYS} days)\n{}\n\n## Active tasks\n{tasks}\n",
        bullet_list(&entities, NOTHING_RECORDED),
        bullet_list(&preferences, NOTHING_RECORDED),
        bullet_list(&recent, NOTHING_RECORDED),
    );
    Ok(primer)
}

/// Build the primer and write it to `PRIMER.md` in the project memory directory.
pub fn write_primer(
    global_root: &Path,
    project_dir: &Path,
    project: &ProjectMeta,
    today: NaiveDate,
) -> Result<PathBuf> {
    let content = build_primer(global_root, Some(project_dir), project, today)?;
    let path = project_dir.join(PRIMER_FILE);
    write_atomic(&path, &content)?;
    info!(path = %path.display(), "updated primer");
    Ok(path)
}

// ── Session journal ──────────────────────────────────────────────────────────

/// Structured end-of-session summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSummary {
    pub request: Option<String>,
    pub learned: Vec<String>,
    pub completed: Vec<String>,
    pub next_steps: Vec<String>,
}

impl SessionSummary {
    pub fn is_empty(&self) -> bool {
        self.request.as_deref().is_none_or(|r| r.trim().is_empty())
            && self.learned.is_empty()
            && self.completed.is_empty()
            && self.next_steps.is_empty()
    }

    fn render(&self, time: &str) -> String {
        let mut out = format!("## Session {time}\n");
        if let Some(request) = self.request.as_deref().map(str::trim)
            && !request.is_empty()
        {
            out.push_str(&format!("\n### Request\n{request}\n"));
        }
        for (heading, items) in [
            ("Learned", &self.learned),
            ("Completed", &self.completed),
            ("Next Steps", &self.next_steps),
        ] {
            let items: Vec<&str> = items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n### {heading}\n"));
            for item in items {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out
    }
}

fn journal_path(project_dir: &Path, date: &str) -> PathBuf {
    project_dir.join("journal").join(format!("{date}.md"))
}

/// The day's journal note, or a fresh one stamped with `date`.
fn open_journal(path: &Path, date: &str) -> Result<NoteFile> {
    Ok(match NoteFile::read(path)? {
        Some(mut note) => {
            note.set_str("updated", date);
            note
        },
        None => {
            let mut note = NoteFile::new("event", 1);
            note.set_str("created", date);
            note.set_str("updated", date);
            note.set_int("sessions", 0);
            note
        },
    })
}

fn append_block(note: &mut NoteFile, block: String, separator: &str) {
    let existing = note.body.trim_end();
    note.body = if existing.is_empty() {
        block
    } else {
        format!("{existing}{separator}{block}")
    };
}

/// Append a session block to the day's journal, creating it if needed.
pub fn write_session(
    project_dir: &Path,
    summary: &SessionSummary,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    let date = now.format("%Y-%m-%d").to_string();
    let path = journal_path(project_dir, &date);
    let block = summary.render(&now.format("%H:%M").to_string());

    let mut note = open_journal(&path, &date)?;
    let sessions = note.get_int("sessions").unwrap_or(0) + 1;
    note.set_int("sessions", sessions);
    append_block(&mut note, block, "\n\n---\n\n");
    note.write(&path)?;
    info!(path = %path.display(), "wrote session summary");
    Ok(path)
}

/// One coding action worth keeping on the day's timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    pub action: String,
    pub result: Option<String>,
    pub files: Vec<String>,
    /// Reusable lesson; also offered to the smart writer.
    pub insight: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Observation {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn insight(&self) -> Option<&str> {
        non_blank(self.insight.as_deref())
    }

    fn render(&self, time: &str) -> String {
        let action = self.action.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut out = format!("### [{time}] {action}\n");
        if let Some(result) = non_blank(self.result.as_deref()) {
            out.push_str(&format!("- **Result:** {result}\n"));
        }
        let files: Vec<&str> = self
            .files
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect();
        if !files.is_empty() {
            out.push_str(&format!("- **Files:** {}\n", files.join(", ")));
        }
        if let Some(insight) = self.insight() {
            out.push_str(&format!("- **Insight:** {insight}\n"));
        }
        out
    }
}

/// Append an observation block to the day's journal. The session counter is
/// left alone.
pub fn write_observation(
    project_dir: &Path,
    observation: &Observation,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    if observation.action.trim().is_empty() {
        return Err(Error::InvalidObservation("action must not be empty".into()));
    }
    let date = now.format("%Y-%m-%d").to_string();
    let path = journal_path(project_dir, &date);
    let block = observation.render(&now.format("%H:%M").to_string());

    let mut note = open_journal(&path, &date)?;
    append_block(&mut note, block, "\n\n");
    note.write(&path)?;
    info!(path = %path.display(), "recorded observation");
    Ok(path)
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
}

impl Task {
    pub fn pending(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidTask("task title must not be empty".into()));
        }
        if self.title.contains('\n') {
            return Err(Error::InvalidTask(format!(
                "task title must be a single line: {:?}",
                self.title
            )));
        }
        Ok(())
    }

    fn render(&self, out: &mut String) {
        let checkbox = if self.status == TaskStatus::Done { "[x]" } else { "[ ]" };
        out.push_str(&format!("- {checkbox} {}\n", self.title.trim()));
        if self.status == TaskStatus::InProgress {
            out.push_str("  - Status: in progress\n");
        }
        if let Some(progress) = &self.progress {
            out.push_str(&format!("  - Progress: {}\n", progress.trim()));
        }
        if let Some(next) = &self.next_step {
            out.push_str(&format!("  - Next: {}\n", next.trim()));
        }
        if !self.related_files.is_empty() {
            out.push_str(&format!("  - Files: {}\n", self.related_files.join(", ")));
        }
    }
}

/// Render `tasks` as a checkbox list into `TASKS.md`. Every task is validated first.
pub fn write_tasks(project_dir: &Path, tasks: &[Task]) -> Result<PathBuf> {
    for task in tasks {
        task.validate()?;
    }
    let mut note = NoteFile::default();
    note.set_str("type", "tasks");
    note.touch();
    for task in tasks {
        task.render(&mut note.body);
    }

    let path = project_dir.join(TASKS_FILE);
    note.write(&path)?;
    info!(path = %path.display(), count = tasks.len(), "updated task list");
    Ok(path)
}

/// Parse the checkbox list written by [`write_tasks`]. A missing file has no tasks.
pub fn read_tasks(project_dir: &Path) -> Result<Vec<Task>> {
    let Some(note) = NoteFile::read(&project_dir.join(TASKS_FILE))? else {
        return Ok(Vec::new());
    };

    let mut tasks: Vec<Task> = Vec::new();
    for line in note.body.lines() {
        let trimmed = line.trim();
        if !line.starts_with(' ') {
            let (status, title) = if let Some(t) = trimmed.strip_prefix("- [x] ") {
                (TaskStatus::Done, t)
            } else if let Some(t) = trimmed.strip_prefix("- [X] ") {
                (TaskStatus::Done, t)
            } else if let Some(t) = trimmed.strip_prefix("- [ ] ") {
                (TaskStatus::Pending, t)
            } else {
                continue;
            };
            tasks.push(Task {
                title: title.trim().to_string(),
                status,
                ..Task::default()
            });
            continue;
        }

        let (Some(task), Some(detail)) = (tasks.last_mut(), trimmed.strip_prefix("- ")) else {
            continue;
        };
        if detail == "Status: in progress" {
            task.status = TaskStatus::InProgress;
        } else if let Some(v) = detail.strip_prefix("Progress: ") {
            task.progress = Some(v.to_string());
        } else if let Some(v) = detail.strip_prefix("Next: ") {
            task.next_step = Some(v.to_string());
        } else if let Some(v) = detail.strip_prefix("Files: ") {
            task.related_files = v.split(", ").map(str::to_string).collect();
        }
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, chrono::TimeZone, tempfile::TempDir};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn empty_primer_has_all_sections() {
        let tmp = TempDir::new().unwrap();
        let primer =
            build_primer(tmp.path(), None, &ProjectMeta::default(), date("2024-05-03")).unwrap();
        for heading in [
            "## User",
            "## Project",
            "## Preferences",
            "## Recent context (last 3 days)",
            "## Active tasks",
        ] {
            assert!(primer.contains(heading), "{heading} missing");
        }
        assert!(primer.contains(NOTHING_RECORDED));
        assert!(primer.contains(NO_TASKS));
    }

    #[test]
    fn primer_collects_notes_journals_and_tasks() {
        let tmp = TempDir::new().unwrap();
        let global = tmp.path().join("global");
        let project = tmp.path().join("project");

        let mut prefs = NoteFile::new("preference", 4);
        for i in 0..7 {
            prefs.append_bullet(&format!("preference number {i}"));
        }
        prefs.write(&global.join("user/preferences.md")).unwrap();

        std::fs::create_dir_all(project.join("journal")).unwrap();
        std::fs::write(
            project.join("journal/2024-05-02.md"),
            "## Session 09:30\n\n### Completed\n- shipped the indexer\n\n### Next Steps\n- not this\n",
        )
        .unwrap();
        std::fs::write(
            project.join("journal/2024-04-20.md"),
            "## Session 10:00\n\n### Completed\n- too old\n",
        )
        .unwrap();
        write_tasks(&project, &[Task::pending("wire the watcher")]).unwrap();

        let meta = ProjectMeta {
            name: "openclaw".into(),
            description: "memory layer".into(),
        };
        let primer = build_primer(&global, Some(&project), &meta, date("2024-05-03")).unwrap();

        assert!(primer.contains("- openclaw | memory layer"));
        assert!(!primer.contains("preference number 1\n"));
        assert!(primer.contains("- preference number 2\n"));
        assert!(primer.contains("- preference number 6\n"));
        assert!(primer.contains("- 2024-05-02 Session 09:30: shipped the indexer"));
        assert!(!primer.contains("not this"));
        assert!(!primer.contains("too old"));
        assert!(primer.contains("- [ ] wire the watcher"));
    }

    #[test]
    fn write_primer_creates_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_primer(
            &tmp.path().join("g"),
            &tmp.path().join("p"),
            &ProjectMeta::default(),
            date("2024-05-03"),
        )
        .unwrap();
        assert!(path.ends_with(PRIMER_FILE));
        assert!(std::fs::read_to_string(path).unwrap().starts_with("## User"));
    }

    #[test]
    fn observations_append_without_counting_sessions() {
        let tmp = TempDir::new().unwrap();
        let morning = Local.with_ymd_and_hms(2024, 5, 3, 9, 15, 0).unwrap();
        let later = Local.with_ymd_and_hms(2024, 5, 3, 11, 40, 0).unwrap();

        let fix = Observation {
            action: "Fixed   the FTS5 query quoting".into(),
            result: Some("searches with hyphens work".into()),
            files: vec!["src/store.rs".into(), " ".into(), "src/search.rs".into()],
            insight: Some("  ".into()),
        };
        let path = write_observation(tmp.path(), &fix, morning).unwrap();
        write_observation(tmp.path(), &Observation::new("Ran the test suite"), later).unwrap();

        let note = NoteFile::read(&path).unwrap().unwrap();
        assert_eq!(note.get_int("sessions"), Some(0));
        assert_eq!(note.get_str("type"), Some("event"));
        assert_eq!(
            note.body,
            "### [09:15] Fixed the FTS5 query quoting\n\
             - **Result:** searches with hyphens work\n\
             - **Files:** src/store.rs, src/search.rs\n\n\
             ### [11:40] Ran the test suite\n"
        );

        let summary = SessionSummary {
            completed: vec!["quoting".into()],
            ..SessionSummary::default()
        };
        write_session(tmp.path(), &summary, later).unwrap();
        let note = NoteFile::read(&path).unwrap().unwrap();
        assert_eq!(note.get_int("sessions"), Some(1));

        assert!(matches!(
            write_observation(tmp.path(), &Observation::new("  "), later),
            Err(Error::InvalidObservation(_))
        ));
    }

    #[test]
    fn sessions_append_and_count() {
        let tmp = TempDir::new().unwrap();
        let summary = SessionSummary {
            request: Some("index the notes".into()),
            learned: vec!["FTS5 needs quoting".into()],
            completed: vec!["wrote the store".into()],
            next_steps: vec![],
        };
        let first = Local.with_ymd_and_hms(2024, 5, 3, 9, 15, 0).unwrap();
        let second = Local.with_ymd_and_hms(2024, 5, 3, 14, 5, 0).unwrap();

        let path = write_session(tmp.path(), &summary, first).unwrap();
        write_session(tmp.path(), &summary, second).unwrap();
        assert!(path.ends_with("journal/2024-05-03.md"));

        let note = NoteFile::read(&path).unwrap().unwrap();
        assert_eq!(note.get_int("sessions"), Some(2));
        assert_eq!(note.get_str("type"), Some("event"));
        assert!(note.body.starts_with("## Session 09:15\n\n### Request\nindex the notes\n"));
        assert!(note.body.contains("## Session 14:05"));
        assert!(note.body.contains("### Completed\n- wrote the store"));
        assert!(!note.body.contains("### Next Steps"));

        let recent = recent_completed(&tmp.path().join("journal"), date("2024-05-03")).unwrap();
        assert_eq!(recent, vec![
            "2024-05-03 Session 09:15: wrote the store".to_string(),
            "2024-05-03 Session 14:05: wrote the store".to_string(),
        ]);
    }

    #[test]
    fn tasks_render_and_parse_back() {
        let tmp = TempDir::new().unwrap();
        let tasks = vec![
            Task {
                title: "ship search".into(),
                status: TaskStatus::InProgress,
                progress: Some("hybrid done".into()),
                next_step: Some("salience".into()),
                related_files: vec!["search.rs".into(), "store.rs".into()],
            },
            Task {
                title: "write docs".into(),
                status: TaskStatus::Done,
                ..Task::default()
            },
        ];
        let path = write_tasks(tmp.path(), &tasks).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("- [ ] ship search\n  - Status: in progress\n"));
        assert!(text.contains("- [x] write docs"));
        assert_eq!(read_tasks(tmp.path()).unwrap(), tasks);
    }

    #[test]
    fn blank_task_title_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = write_tasks(tmp.path(), &[Task::pending("  ")]).unwrap_err();
        assert!(matches!(err, Error::InvalidTask(_)));
        assert!(!tmp.path().join(TASKS_FILE).exists());
    }

    #[test]
    fn task_json_defaults_to_pending() {
        let tasks: Vec<Task> = serde_json::from_str(r#"[{"title": "a"}, {"title": "b", "status": "done"}]"#).unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[1].status, TaskStatus::Done);
    }
}
