//! Keep the index in sync with note files edited outside the writer.

use std::{
    collections::BTreeSet,
    future::Future,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use {
    notify_debouncer_full::{
        DebounceEventResult, new_debouncer,
        notify::{EventKind, RecursiveMode},
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    error::Result,
    indexer::is_indexable,
    manager::MemoryManager,
};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

/// Whether a change to `path` should touch the index: a non-generated
/// markdown file under one of `roots` with no hidden path segment.
pub fn should_handle(path: &Path, roots: &[PathBuf]) -> bool {
    if !is_indexable(path) {
        return false;
    }
    let Some(relative) = roots.iter().find_map(|root| path.strip_prefix(root).ok()) else {
        return false;
    };
    !relative.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Watch every memory root and re-index changed note files until `shutdown` resolves.
pub async fn watch(manager: &MemoryManager, shutdown: impl Future<Output = ()>) -> Result<()> {
    let roots = manager.memory_roots();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

    let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|event| {
                        matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        )
                    })
                    .flat_map(|event| event.event.paths)
                    .collect();
                if !paths.is_empty() {
                    let _ = tx.send(paths);
                }
            },
            Err(errors) => {
                for error in errors {
                    warn!(%error, "file watcher error");
                }
            },
        }
    })?;

    for root in &roots {
        std::fs::create_dir_all(root)?;
        debouncer.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching memory directory");
    }

    tokio::pin!(shutdown);
    loop {
        let batch = tokio::select! {
            _ = &mut shutdown => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let changed: BTreeSet<PathBuf> = batch
            .into_iter()
            .filter(|path| should_handle(path, &roots))
            .collect();
        for path in changed {
            match manager.sync_path(&path).await {
                Ok(chunks) => debug!(path = %path.display(), chunks, "re-indexed"),
                Err(e) => warn!(path = %path.display(), error = %e, "re-index failed"),
            }
        }
    }
    info!("file watcher stopped");
    Ok(())
}
