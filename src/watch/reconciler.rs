//! Watch reconciler
//!
//! Turns filesystem changes into service actions. Each change is matched
//! against the active rules; matching rules queue an action that fires once
//! the path has been quiet for the debounce window. Identical actions queued
//! within the window collapse, so a burst of edits to one file syncs it once
//! and any number of triggers for one service rebuild it once. A queued
//! rebuild supersedes syncs into the same service.

use super::glob::PathMatcher;
use crate::error::{MusterError, Result};
use crate::manifest::{WatchAction, WatchRule};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

/// Default quiet period before a queued action fires
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// A queued reaction to a change
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Copy `source` to `target` inside the running service
    Sync {
        service: String,
        source: PathBuf,
        target: String,
    },
    /// Copy, then restart the service
    SyncRestart {
        service: String,
        source: PathBuf,
        target: String,
    },
    /// Rebuild the service's image and restart it
    Rebuild { service: String },
}

impl Action {
    /// Service the action applies to
    pub fn service(&self) -> &str {
        match self {
            Action::Sync { service, .. }
            | Action::SyncRestart { service, .. }
            | Action::Rebuild { service } => service,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Sync {
                service,
                source,
                target,
            } => write!(f, "sync {} -> {}:{}", source.display(), service, target),
            Action::SyncRestart {
                service,
                source,
                target,
            } => write!(
                f,
                "sync {} -> {}:{} and restart",
                source.display(),
                service,
                target
            ),
            Action::Rebuild { service } => write!(f, "rebuild {}", service),
        }
    }
}

/// Where actions are carried out
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Mirror `source` into the service at `target`
    async fn sync(&self, service: &str, source: &Path, target: &str) -> Result<()>;

    /// Restart the service
    async fn restart(&self, service: &str) -> Result<()>;

    /// Rebuild the service's image and restart it
    async fn rebuild(&self, service: &str) -> Result<()>;
}

#[async_trait]
impl ActionSink for Orchestrator {
    async fn sync(&self, service: &str, source: &Path, target: &str) -> Result<()> {
        Orchestrator::sync(self, service, source, target).await
    }

    async fn restart(&self, service: &str) -> Result<()> {
        Orchestrator::restart(self, service).await
    }

    async fn rebuild(&self, service: &str) -> Result<()> {
        Orchestrator::rebuild(self, service).await.map(|_| ())
    }
}

struct CompiledRule {
    rule: WatchRule,
    matcher: PathMatcher,
}

/// Matches changes to rules and runs the resulting actions
pub struct Reconciler {
    rules: Vec<CompiledRule>,
    sink: Arc<dyn ActionSink>,
    debounce: Duration,
    pending: HashMap<Action, Instant>,
}

impl Reconciler {
    /// Compile `rules` relative to `project_dir`
    pub fn new(
        project_dir: &Path,
        rules: Vec<WatchRule>,
        sink: Arc<dyn ActionSink>,
        debounce: Duration,
    ) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let matcher = PathMatcher::new(project_dir, &rule.path, &rule.ignore)?;
                Ok(CompiledRule { rule, matcher })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            sink,
            debounce,
            pending: HashMap::new(),
        })
    }

    /// Paths to observe, one per rule root
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.rules.iter().map(|r| r.matcher.root()).collect();
        roots.sort();
        roots.dedup();
        roots
    }

    /// Actions a change to `path` calls for
    pub fn actions_for(&self, path: &Path) -> Vec<Action> {
        let mut actions = Vec::new();
        for compiled in &self.rules {
            if !compiled.matcher.matches(path) {
                continue;
            }
            let rule = &compiled.rule;
            let service = rule.service.clone();
            let action = match rule.action {
                WatchAction::Rebuild => Action::Rebuild { service },
                WatchAction::Sync | WatchAction::SyncRestart => {
                    let Some(target) = rule
                        .target
                        .as_deref()
                        .and_then(|t| compiled.matcher.target_for(path, t))
                    else {
                        continue;
                    };
                    if rule.action == WatchAction::Sync {
                        Action::Sync {
                            service,
                            source: path.to_path_buf(),
                            target,
                        }
                    } else {
                        Action::SyncRestart {
                            service,
                            source: path.to_path_buf(),
                            target,
                        }
                    }
                }
            };
            if !actions.contains(&action) {
                actions.push(action);
            }
        }

        let rebuilt: Vec<String> = actions
            .iter()
            .filter(|a| matches!(a, Action::Rebuild { .. }))
            .map(|a| a.service().to_string())
            .collect();
        actions.retain(|a| {
            matches!(a, Action::Rebuild { .. }) || !rebuilt.iter().any(|s| s == a.service())
        });
        actions
    }

    /// Queue the actions for a change. Returns what was queued.
    pub fn enqueue(&mut self, path: &Path) -> Vec<Action> {
        let mut actions = self.actions_for(path);
        actions.retain(|action| {
            matches!(action, Action::Rebuild { .. })
                || !self.pending.contains_key(&Action::Rebuild {
                    service: action.service().to_string(),
                })
        });

        let deadline = Instant::now() + self.debounce;
        for action in &actions {
            if let Action::Rebuild { service } = action {
                self.pending.retain(|queued, _| {
                    matches!(queued, Action::Rebuild { .. }) || queued.service() != service.as_str()
                });
            }
            tracing::debug!("Queued {} ({})", action, path.display());
            self.pending.insert(action.clone(), deadline);
        }
        actions
    }

    /// Number of queued actions
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Run every action whose window has passed. A failed action is
    /// reported and dropped.
    pub async fn flush_due(&mut self) -> Vec<(Action, Result<()>)> {
        let now = Instant::now();
        let mut due: Vec<(Action, Instant)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(action, deadline)| (action.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        let mut results = Vec::with_capacity(due.len());
        for (action, _) in due {
            self.pending.remove(&action);
            let result = self.execute(&action).await;
            match &result {
                Ok(()) => tracing::info!("Watch: {}", action),
                Err(e) => tracing::error!("Watch: {} failed: {}", action, e),
            }
            results.push((action, result));
        }
        results
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        match action {
            Action::Sync {
                service,
                source,
                target,
            } => self.sink.sync(service, source, target).await,
            Action::SyncRestart {
                service,
                source,
                target,
            } => {
                self.sink.sync(service, source, target).await?;
                self.sink.restart(service).await
            }
            Action::Rebuild { service } => self.sink.rebuild(service).await,
        }
    }

    /// Consume change events until shutdown or until the event source ends.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!("Watching {} rules", self.rules.len());

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(path) => {
                        self.enqueue(&path);
                    }
                    None => {
                        return Err(MusterError::Watch("event source closed".to_string()));
                    }
                },
                _ = async {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.flush_due().await;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{ComposeParser, EnvSource};
    use crate::manifest::{Manifest, DEFAULT_PROFILE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
        fail_rebuild: bool,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn sync(&self, service: &str, source: &Path, target: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("sync {} {} {}", service, source.display(), target));
            Ok(())
        }

        async fn restart(&self, service: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("restart {}", service));
            Ok(())
        }

        async fn rebuild(&self, service: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("rebuild {}", service));
            if self.fail_rebuild {
                return Err(MusterError::Build {
                    stage: "production".into(),
                    service: service.into(),
                    message: "poetry install failed".into(),
                });
            }
            Ok(())
        }
    }

    const YAML: &str = r#"
services:
  web:
    build: ./backend
    develop:
      watch:
        - action: sync
          path: ./backend
          target: /app
          ignore: ["*.pyc", "__pycache__"]
        - action: rebuild
          path: ./backend/poetry.lock
        - action: rebuild
          path: ./backend/pyproject.toml
  worker:
    image: worker
    develop:
      watch:
        - action: sync+restart
          path: ./worker/tasks.py
          target: /srv/tasks.py
"#;

    fn reconciler(sink: Arc<RecordingSink>) -> Reconciler {
        let config = ComposeParser::parse_str(YAML, &EnvSource::new()).unwrap();
        let manifest =
            Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "shop").unwrap();
        Reconciler::new(
            Path::new("/p"),
            manifest.watch_rules(),
            sink,
            DEFAULT_DEBOUNCE,
        )
        .unwrap()
    }

    #[test]
    fn test_ignored_paths_enqueue_nothing() {
        let mut r = reconciler(Arc::new(RecordingSink::default()));
        assert!(r.enqueue(Path::new("/p/backend/app/views.pyc")).is_empty());
        assert!(r
            .enqueue(Path::new("/p/backend/__pycache__/views.cpython-312.pyc"))
            .is_empty());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_lock_file_enqueues_rebuild() {
        let mut r = reconciler(Arc::new(RecordingSink::default()));
        let actions = r.enqueue(Path::new("/p/backend/poetry.lock"));
        assert_eq!(
            actions,
            vec![Action::Rebuild {
                service: "web".into()
            }]
        );
    }

    #[test]
    fn test_source_change_enqueues_sync() {
        let mut r = reconciler(Arc::new(RecordingSink::default()));
        let actions = r.enqueue(Path::new("/p/backend/app/views.py"));
        assert_eq!(
            actions,
            vec![Action::Sync {
                service: "web".into(),
                source: PathBuf::from("/p/backend/app/views.py"),
                target: "/app/app/views.py".into(),
            }]
        );
        assert!(r.enqueue(Path::new("/p/docs/index.md")).is_empty());
    }

    #[test]
    fn test_roots() {
        let r = reconciler(Arc::new(RecordingSink::default()));
        assert_eq!(
            r.roots(),
            vec![
                PathBuf::from("/p/backend"),
                PathBuf::from("/p/backend/poetry.lock"),
                PathBuf::from("/p/backend/pyproject.toml"),
                PathBuf::from("/p/worker/tasks.py"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_action() {
        let sink = Arc::new(RecordingSink::default());
        let mut r = reconciler(sink.clone());

        for _ in 0..5 {
            r.enqueue(Path::new("/p/backend/app/views.py"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(r.flush_due().await.is_empty());
        tokio::time::sleep(DEFAULT_DEBOUNCE).await;
        let results = r.flush_due().await;

        assert_eq!(results.len(), 1);
        assert_eq!(
            sink.calls(),
            vec!["sync web /p/backend/app/views.py /app/app/views.py".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_triggers_collapse_and_supersede_syncs() {
        let sink = Arc::new(RecordingSink::default());
        let mut r = reconciler(sink.clone());

        r.enqueue(Path::new("/p/backend/app/views.py"));
        r.enqueue(Path::new("/p/backend/poetry.lock"));
        r.enqueue(Path::new("/p/backend/pyproject.toml"));
        assert!(r.enqueue(Path::new("/p/backend/app/models.py")).is_empty());
        assert_eq!(r.pending(), 1);

        tokio::time::sleep(DEFAULT_DEBOUNCE).await;
        r.flush_due().await;

        assert_eq!(sink.calls(), vec!["rebuild web".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_restart() {
        let sink = Arc::new(RecordingSink::default());
        let mut r = reconciler(sink.clone());
        r.enqueue(Path::new("/p/worker/tasks.py"));
        tokio::time::sleep(DEFAULT_DEBOUNCE).await;
        r.flush_due().await;
        assert_eq!(
            sink.calls(),
            vec![
                "sync worker /p/worker/tasks.py /srv/tasks.py".to_string(),
                "restart worker".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rebuild_keeps_loop_running() {
        let sink = Arc::new(RecordingSink {
            fail_rebuild: true,
            ..Default::default()
        });
        let r = reconciler(sink.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(r.run(rx, shutdown));

        tx.send(PathBuf::from("/p/backend/poetry.lock")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(PathBuf::from("/p/backend/app/urls.py")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            sink.calls(),
            vec![
                "rebuild web".to_string(),
                "sync web /p/backend/app/urls.py /app/app/urls.py".to_string(),
            ]
        );
        stop.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
