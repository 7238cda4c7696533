//! `openclaw-memory`: index, search and write the markdown memory from a shell.

use std::path::PathBuf;

use {
    anyhow::{Context, Result, bail},
    clap::{Parser, Subcommand},
    openclaw_memory::{
        MemoryManager, load_config,
        primer::{Observation, SessionSummary, Task},
        search::SearchResponse,
        writer::{WriteAction, WriteOutcome},
    },
    serde::Serialize,
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, prelude::*},
};

#[derive(Parser, Debug)]
#[command(name = "openclaw-memory", version, about = "Persistent markdown memory for coding agents")]
struct Cli {
    /// Directory used to detect the project (defaults to the current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Global memory directory (defaults to ~/.openclaw_memory).
    #[arg(long, global = true)]
    global_root: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-index every memory file
    Index,

    /// Search memories
    Search {
        query: String,

        /// Restrict to a top-level directory such as `user`, `agent` or `journal`
        #[arg(long, default_value = "")]
        scope: String,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Record a memory through the quality gate and router
    Log {
        content: String,

        /// preference, instruction, entity, decision, pattern or event
        #[arg(long = "type")]
        memory_type: Option<String>,
    },

    /// Print the session primer
    Primer,

    /// Show index statistics per memory root
    Status,

    /// Write a session summary to today's journal
    SessionEnd {
        #[arg(long)]
        request: Option<String>,

        /// Comma-separated
        #[arg(long, value_delimiter = ',')]
        learned: Vec<String>,

        /// Comma-separated
        #[arg(long, value_delimiter = ',')]
        completed: Vec<String>,

        /// Comma-separated; each becomes a pending task
        #[arg(long = "next", value_delimiter = ',')]
        next_steps: Vec<String>,
    },

    /// Record a coding action on today's journal
    Observe {
        /// What was done, e.g. "Fixed N+1 query in the user list"
        action: String,

        #[arg(long)]
        result: Option<String>,

        /// Comma-separated files touched
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,

        /// Reusable lesson; also stored as a memory
        #[arg(long)]
        insight: Option<String>,
    },

    /// Replace the task list with a JSON array of tasks
    Tasks { tasks_json: String },

    /// Print a memory file, e.g. `user/preferences.md`
    Read { path: String },

    /// Index, then keep the index in sync with file changes until Ctrl-C
    #[cfg(feature = "file-watcher")]
    Watch,
}

fn init_tracing() -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("openclaw_memory=info,openclaw_memory_cli=info"),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("failed to initialise logging")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_search(response: &SearchResponse) {
    println!(
        "{:?}: {} result(s), {} tokens ({} left)",
        response.strategy,
        response.results.len(),
        response.total_tokens,
        response.budget_remaining
    );
    for result in &response.results {
        println!(
            "\n## {} (salience {:.2}, semantic {:.2})",
            result.uri, result.salience, result.semantic_score
        );
        println!("{}", result.content.trim_end());
    }
}

fn print_outcome(outcome: &WriteOutcome) {
    match outcome.action {
        WriteAction::Rejected => println!("not stored: {}", outcome.reason),
        WriteAction::Reinforced => println!(
            "reinforced existing memory ({}) in {}",
            outcome.reason, outcome.target_file
        ),
        WriteAction::Replaced => println!(
            "replaced conflicting memory ({}) in {}",
            outcome.reason, outcome.target_file
        ),
        WriteAction::Appended => println!(
            "saved to {} (type: {})",
            outcome.target_file, outcome.memory_type
        ),
    }
}

async fn run(cli: Cli, manager: &MemoryManager) -> Result<()> {
    match cli.command {
        Commands::Index => {
            let report = manager.index_all().await?;
            if cli.json {
                return print_json(&report);
            }
            for (scope, files) in [("global", &report.global), ("project", &report.project)] {
                for (uri, chunks) in files {
                    println!("{scope}\t{uri}\t{chunks}");
                }
            }
            println!("{} chunk(s) indexed", report.total_chunks());
        },
        Commands::Search {
            query,
            scope,
            max_tokens,
            top_k,
        } => {
            let response = manager.search(&query, &scope, max_tokens, top_k).await?;
            if cli.json {
                return print_json(&response);
            }
            print_search(&response);
        },
        Commands::Log {
            content,
            memory_type,
        } => {
            let outcome = manager.log(&content, memory_type.as_deref()).await?;
            if cli.json {
                return print_json(&outcome);
            }
            print_outcome(&outcome);
        },
        Commands::Primer => println!("{}", manager.primer()?),
        Commands::Status => {
            let status = manager.status().await?;
            if cli.json {
                return print_json(&status);
            }
            println!("model: {} ({} dims)", status.embedding_model, status.dimension);
            for root in &status.roots {
                println!(
                    "{}: {} ({} file(s), {} chunk(s))",
                    root.scope,
                    root.root.display(),
                    root.stats.total_files,
                    root.stats.total_chunks
                );
                for (memory_type, count) in &root.stats.chunks_by_type {
                    println!("  {memory_type}: {count}");
                }
            }
        },
        Commands::SessionEnd {
            request,
            learned,
            completed,
            next_steps,
        } => {
            let summary = SessionSummary {
                request,
                learned,
                completed,
                next_steps,
            };
            if summary.is_empty() {
                bail!("nothing to record: pass --request, --learned, --completed or --next");
            }
            let path = manager.session_end(&summary).await?;
            println!("session summary written to {}", path.display());
        },
        Commands::Observe {
            action,
            result,
            files,
            insight,
        } => {
            let observation = Observation {
                action,
                result,
                files,
                insight,
            };
            let outcome = manager.observe(&observation).await?;
            if cli.json {
                return print_json(&outcome);
            }
            println!("observation recorded in {}", outcome.journal.display());
            if let Some(insight) = &outcome.insight {
                print_outcome(insight);
            }
        },
        Commands::Tasks { tasks_json } => {
            let tasks: Vec<Task> =
                serde_json::from_str(&tasks_json).context("expected a JSON array of tasks")?;
            let path = manager.update_tasks(&tasks)?;
            println!("{} task(s) written to {}", tasks.len(), path.display());
        },
        Commands::Read { path } => match manager.read_file(&path)? {
            Some(text) => print!("{text}"),
            None => bail!("file not found: {path}"),
        },
        #[cfg(feature = "file-watcher")]
        Commands::Watch => {
            manager.index_all().await?;
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                }
            };
            openclaw_memory::watcher::watch(manager, shutdown).await?;
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = Cli::parse();
    let cwd = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    let config = load_config(&cwd, cli.global_root.clone())?;
    debug!(global = %config.global_root.display(), project = ?config.project_root, "resolved roots");

    let manager = MemoryManager::open(config).await?;
    let result = run(cli, &manager).await;
    manager.close().await;
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn session_end_splits_comma_lists() {
        let cli = Cli::try_parse_from([
            "openclaw-memory",
            "session-end",
            "--completed",
            "indexer,watcher",
            "--next",
            "ship",
        ])
        .unwrap();
        match cli.command {
            Commands::SessionEnd {
                completed,
                next_steps,
                ..
            } => {
                assert_eq!(completed, vec!["indexer", "watcher"]);
                assert_eq!(next_steps, vec!["ship"]);
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn observe_takes_action_and_optional_details() {
        let cli = Cli::try_parse_from([
            "openclaw-memory",
            "observe",
            "Fixed the flaky watcher test",
            "--files",
            "src/watcher.rs,src/manager.rs",
            "--insight",
            "Debounce windows need paused time in tests",
        ])
        .unwrap();
        match cli.command {
            Commands::Observe {
                action,
                result,
                files,
                insight,
            } => {
                assert_eq!(action, "Fixed the flaky watcher test");
                assert!(result.is_none());
                assert_eq!(files, vec!["src/watcher.rs", "src/manager.rs"]);
                assert!(insight.is_some());
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn log_accepts_explicit_type_and_global_flags() {
        let cli = Cli::try_parse_from([
            "openclaw-memory",
            "log",
            "Prefers tabs over spaces",
            "--type",
            "preference",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Log { memory_type: Some(ref t), .. } if t == "preference"
        ));
    }
}
