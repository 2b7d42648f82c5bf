//! Service runtime
//!
//! The orchestrator never launches anything itself; it goes through a
//! [`ContainerRuntime`]. [`ProcessRuntime`] runs each service as a local
//! process group, which is what the CLI uses.

pub mod process;

#[cfg(test)]
pub mod fake;

pub use process::ProcessRuntime;

use crate::error::Result;
use crate::manifest::Command;
use crate::storage::Binding;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to launch one service instance
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Service name
    pub service: String,
    /// Image reference (pulled or built)
    pub image: Option<String>,
    /// Entrypoint followed by command
    pub argv: Vec<String>,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Working directory inside the service
    pub working_dir: Option<String>,
    /// Project directory
    pub project_dir: PathBuf,
    /// Resolved mounts and networks
    pub binding: Binding,
}

/// A running service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance ID
    pub id: String,
    /// Service name
    pub service: String,
    /// Process (group) ID, when the runtime has one
    pub pid: Option<u32>,
    /// Image the instance runs
    pub image: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
}

impl Instance {
    /// New instance record with a fresh ID
    pub fn new(service: &str, pid: Option<u32>, image: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            service: service.to_string(),
            pid,
            image,
            started_at: Utc::now(),
        }
    }
}

/// Launches, probes and stops service instances
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start an instance
    async fn start(&self, spec: &LaunchSpec) -> Result<Instance>;

    /// Stop an instance, forcing it after `grace`
    async fn stop(&self, instance: &Instance, grace: Duration) -> Result<()>;

    /// Run a health probe. `Ok(true)` means the probe passed. The caller
    /// bounds the call with the probe timeout.
    async fn probe(&self, instance: &Instance, test: &Command) -> Result<bool>;

    /// Wait for the instance to exit, returning its exit code
    async fn wait(&self, instance: &Instance) -> Result<i32>;

    /// Copy `source` (file or directory) to `target` inside the instance
    async fn sync(&self, instance: &Instance, source: &Path, target: &str) -> Result<()>;
}
