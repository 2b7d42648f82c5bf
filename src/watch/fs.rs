//! Filesystem events
//!
//! Bridges the `notify` watcher thread into a tokio channel of changed
//! paths.

use crate::error::{MusterError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Keeps the underlying watcher alive
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl FsWatcher {
    /// Watch `roots`. Directories are watched recursively; a file is watched
    /// through its parent so replacing it is still seen.
    pub fn start(roots: &[PathBuf]) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_change(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if tx.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!("Filesystem watch error: {}", e),
        })
        .map_err(watch_error)?;

        let mut watched = Vec::new();
        for root in roots {
            let Some((path, mode)) = watch_target(root) else {
                tracing::warn!("Not watching {}: no such path", root.display());
                continue;
            };
            if watched.contains(&path) {
                continue;
            }
            watcher.watch(&path, mode).map_err(watch_error)?;
            tracing::debug!("Watching {} ({:?})", path.display(), mode);
            watched.push(path);
        }

        Ok((
            Self {
                _watcher: watcher,
                roots: watched,
            },
            rx,
        ))
    }

    /// Paths actually registered with the watcher
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

fn watch_error(e: notify::Error) -> MusterError {
    MusterError::Watch(e.to_string())
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn watch_target(root: &Path) -> Option<(PathBuf, RecursiveMode)> {
    if root.is_dir() {
        return Some((root.to_path_buf(), RecursiveMode::Recursive));
    }
    root.parent()
        .filter(|p| p.is_dir())
        .map(|p| (p.to_path_buf(), RecursiveMode::NonRecursive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_watch_target() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("poetry.lock");
        std::fs::write(&file, "").unwrap();

        let (path, mode) = watch_target(dir.path()).unwrap();
        assert_eq!(path, dir.path());
        assert_eq!(mode, RecursiveMode::Recursive);

        let (path, mode) = watch_target(&file).unwrap();
        assert_eq!(path, dir.path());
        assert_eq!(mode, RecursiveMode::NonRecursive);

        assert!(watch_target(Path::new("/nonexistent/muster/x")).is_none());
    }

    #[tokio::test]
    async fn test_changes_arrive_on_channel() {
        let dir = TempDir::new().unwrap();
        let (watcher, mut rx) = FsWatcher::start(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(watcher.roots().len(), 1);

        let file = dir.path().join("app.py");
        std::fs::write(&file, "print('hi')").unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name(), file.file_name());
    }
}
