//! Local process runtime
//!
//! Each service runs as its own process group on the host. A service gets a
//! private root directory (`<state>/rootfs/<service>`) that sync actions copy
//! into; it is exported to the process as `MUSTER_ROOT`.

use super::{ContainerRuntime, Instance, LaunchSpec};
use crate::error::{MusterError, Result};
use crate::manifest::Command;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// How often a process we did not spawn is checked for exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Launch context kept for probes
#[derive(Debug, Clone)]
struct ProcessContext {
    env: BTreeMap<String, String>,
    cwd: PathBuf,
}

/// Runs services as host processes
pub struct ProcessRuntime {
    /// Root for per-service directories
    root: PathBuf,
    /// Directory for service output, when not attached to the terminal
    log_dir: Option<PathBuf>,
    /// Exit code channels by instance ID
    exits: Mutex<HashMap<String, watch::Receiver<Option<i32>>>>,
    /// Senders for instances without a process
    idle: Mutex<HashMap<String, watch::Sender<Option<i32>>>>,
    /// Launch contexts by instance ID
    contexts: Mutex<HashMap<String, ProcessContext>>,
}

impl ProcessRuntime {
    /// Create a runtime rooted at `root`
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            log_dir: None,
            exits: Mutex::new(HashMap::new()),
            idle: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Send service output to `<dir>/<service>.log` instead of the terminal
    pub fn with_log_dir(mut self, dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        self.log_dir = Some(dir);
        Ok(self)
    }

    /// Private root directory of a service
    pub fn service_root(&self, service: &str) -> PathBuf {
        self.root.join(service)
    }

    /// Terminate a process group we may not have spawned (e.g. one left by a
    /// detached `up`).
    pub async fn terminate(pid: u32, grace: Duration) -> Result<()> {
        if !is_alive(pid) {
            return Ok(());
        }
        signal_group(pid, libc::SIGTERM)?;
        if wait_gone(pid, grace).await {
            return Ok(());
        }
        tracing::warn!("Process {} did not stop within {:?}, killing", pid, grace);
        signal_group(pid, libc::SIGKILL)?;
        wait_gone(pid, KILL_WAIT).await;
        Ok(())
    }

    /// Whether a process with this id still exists
    pub fn is_running(pid: u32) -> bool {
        is_alive(pid)
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| MusterError::Lock("Failed to acquire runtime lock".to_string()))
    }

    /// Drop the bookkeeping of an instance, returning its exit channel
    fn forget(&self, id: &str) -> Result<Option<watch::Receiver<Option<i32>>>> {
        Self::lock(&self.contexts)?.remove(id);
        Ok(Self::lock(&self.exits)?.remove(id))
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.exits.lock().map(|m| m.len()).unwrap_or(0)
            + self.contexts.lock().map(|m| m.len()).unwrap_or(0)
            + self.idle.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn output(&self, service: &str) -> Result<(Stdio, Stdio)> {
        match &self.log_dir {
            Some(dir) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("{}.log", service)))?;
                Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
            }
            None => Ok((Stdio::inherit(), Stdio::inherit())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn start(&self, spec: &LaunchSpec) -> Result<Instance> {
        let root = self.service_root(&spec.service);
        std::fs::create_dir_all(&root)?;

        let cwd = spec
            .working_dir
            .as_deref()
            .map(Path::new)
            .filter(|p| p.is_absolute() && p.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| spec.project_dir.clone());

        let mut env = spec.env.clone();
        env.insert("MUSTER_SERVICE".to_string(), spec.service.clone());
        env.insert("MUSTER_ROOT".to_string(), root.display().to_string());
        if let Some(image) = &spec.image {
            env.insert("MUSTER_IMAGE".to_string(), image.clone());
        }

        let (tx, rx) = watch::channel(None);

        let Some((program, args)) = spec.argv.split_first() else {
            // Nothing to execute: the instance exists until it is stopped.
            let instance = Instance::new(&spec.service, None, spec.image.clone());
            tracing::debug!("Service {} has no command, running idle", spec.service);
            Self::lock(&self.idle)?.insert(instance.id.clone(), tx);
            Self::lock(&self.exits)?.insert(instance.id.clone(), rx);
            Self::lock(&self.contexts)?.insert(instance.id.clone(), ProcessContext { env, cwd });
            return Ok(instance);
        };

        let (stdout, stderr) = self.output(&spec.service)?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| MusterError::Start {
                service: spec.service.clone(),
                message: format!("cannot execute {}: {}", program, e),
            })?;

        let instance = Instance::new(&spec.service, child.id(), spec.image.clone());
        tracing::debug!(
            "Started {} as pid {:?} (instance {})",
            spec.service,
            instance.pid,
            instance.id
        );

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                Err(_) => -1,
            };
            let _ = tx.send(Some(code));
        });

        Self::lock(&self.exits)?.insert(instance.id.clone(), rx);
        Self::lock(&self.contexts)?.insert(instance.id.clone(), ProcessContext { env, cwd });
        Ok(instance)
    }

    async fn stop(&self, instance: &Instance, grace: Duration) -> Result<()> {
        let idle = Self::lock(&self.idle)?.remove(&instance.id);
        let rx = self.forget(&instance.id)?;
        if let Some(tx) = idle {
            let _ = tx.send(Some(0));
            return Ok(());
        }

        let Some(pid) = instance.pid else {
            return Ok(());
        };

        let Some(mut rx) = rx else {
            return Self::terminate(pid, grace).await;
        };

        if rx.borrow().is_some() {
            return Ok(());
        }

        signal_group(pid, libc::SIGTERM)?;
        if tokio::time::timeout(grace, wait_exit(&mut rx)).await.is_ok() {
            return Ok(());
        }

        tracing::warn!(
            "Service {} did not stop within {:?}, killing",
            instance.service,
            grace
        );
        signal_group(pid, libc::SIGKILL)?;
        let _ = tokio::time::timeout(KILL_WAIT, wait_exit(&mut rx)).await;
        Ok(())
    }

    async fn probe(&self, instance: &Instance, test: &Command) -> Result<bool> {
        let context = Self::lock(&self.contexts)?.get(&instance.id).cloned();
        let argv = test.argv();
        let Some((program, args)) = argv.split_first() else {
            return Ok(false);
        };

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(context) = context {
            command.envs(&context.env).current_dir(&context.cwd);
        }

        match command.status().await {
            Ok(status) => Ok(status.success()),
            Err(e) => {
                tracing::debug!("Probe for {} could not run: {}", instance.service, e);
                Ok(false)
            }
        }
    }

    async fn wait(&self, instance: &Instance) -> Result<i32> {
        let rx = Self::lock(&self.exits)?.get(&instance.id).cloned();
        match rx {
            Some(mut rx) => {
                let code = wait_exit(&mut rx).await;
                self.forget(&instance.id)?;
                Ok(code)
            }
            None => {
                let Some(pid) = instance.pid else {
                    return Ok(0);
                };
                while is_alive(pid) {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(0)
            }
        }
    }

    async fn sync(&self, instance: &Instance, source: &Path, target: &str) -> Result<()> {
        let dest = self
            .service_root(&instance.service)
            .join(target.trim_start_matches('/'));
        let source = source.to_path_buf();

        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| MusterError::Watch(format!("sync task failed: {}", e)))?
    }
}

/// Mirror `source` onto `dest`. A missing source removes `dest`.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    if !source.exists() {
        if dest.is_dir() {
            std::fs::remove_dir_all(dest)?;
        } else if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        return Ok(());
    }

    if source.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| MusterError::Watch(e.to_string()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    loop {
        if let Some(code) = *rx.borrow() {
            return code;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().unwrap_or(-1);
        }
    }
}

fn signal_group(pid: u32, signal: i32) -> Result<()> {
    let result = unsafe { libc::kill(-(pid as i32), signal) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

async fn wait_gone(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    !is_alive(pid)
}
