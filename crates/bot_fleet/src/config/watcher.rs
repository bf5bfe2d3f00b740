//! Change notification for the instances file.
//!
//! Backed by `notify`. The watcher observes the file's parent directory so
//! that editors replacing the file (write to temp, rename over) are seen, and
//! so that a file created after startup is picked up.

use super::desired::{DesiredState, DesiredStateStore};
use crate::error::ConfigError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keeps the OS watch and its reload task alive. Dropping it stops both.
pub struct DesiredStateWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    path: PathBuf,
}

impl std::fmt::Debug for DesiredStateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesiredStateWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for DesiredStateWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl DesiredStateStore {
    /// Publishes a fresh [`DesiredState`] whenever the instances file changes.
    ///
    /// The receiver starts out holding `initial`. A reload that fails to parse
    /// is logged and skipped, leaving the previous snapshot in place. Reloads
    /// that produce an identical state are not published.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Watch`] if the OS watcher cannot be created or the
    /// directory cannot be watched.
    pub fn watch(
        &self,
        initial: DesiredState,
    ) -> Result<(watch::Receiver<DesiredState>, DesiredStateWatcher), ConfigError> {
        let path = self.path().to_path_buf();
        let dir = watch_dir(&path);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })
        .map_err(|e| ConfigError::Watch(path.clone(), e))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch(dir.clone(), e))?;
        info!("👀 Watching {} for instance changes", path.display());

        let (state_tx, state_rx) = watch::channel(initial);
        let store = self.clone();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            while let Some(res) = event_rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("File watcher error: {}", e);
                        continue;
                    }
                };
                if !is_relevant(&event, &task_path) {
                    continue;
                }

                match store.load().await {
                    Ok(state) => {
                        let changed = state_tx.send_if_modified(|current| {
                            if *current == state {
                                false
                            } else {
                                *current = state;
                                true
                            }
                        });
                        if changed {
                            debug!("Published new desired state");
                        }
                    }
                    Err(e) => {
                        warn!("⚠️ Ignoring invalid instances file, keeping previous state: {}", e);
                    }
                }

                if state_tx.is_closed() {
                    break;
                }
            }
        });

        Ok((
            state_rx,
            DesiredStateWatcher {
                _watcher: watcher,
                task,
                path,
            },
        ))
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether a raw event touches the watched file in a way that can change it.
fn is_relevant(event: &Event, path: &Path) -> bool {
    let mutating = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    let Some(name) = path.file_name() else {
        return false;
    };
    mutating && event.paths.iter().any(|p| p.file_name() == Some(name))
}
