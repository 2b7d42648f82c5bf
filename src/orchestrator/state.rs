//! Persisted run state
//!
//! A detached `up` leaves its instances behind; `down` from another
//! invocation finds them through `<state dir>/state.json`.

use crate::error::Result;
use crate::runtime::Instance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the run state inside the state directory
pub const STATE_FILE: &str = "state.json";

/// What a run left running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Project name
    pub project: String,
    /// Active profile
    pub profile: String,
    /// Instances in start order
    pub instances: Vec<Instance>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh state for a run
    pub fn new(project: &str, profile: &str) -> Self {
        let now = Utc::now();
        Self {
            project: project.to_string(),
            profile: profile.to_string(),
            instances: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Path of the state file under `state_dir`
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }

    /// Load the state, if a run left one
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write the state, replacing the file atomically
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)?;
        self.updated_at = Utc::now();
        let path = Self::path(state_dir);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!("Saved run state to {}", path.display());
        Ok(())
    }

    /// Remove the state file
    pub fn remove(state_dir: &Path) -> Result<()> {
        let path = Self::path(state_dir);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Instances in the order they should be stopped
    pub fn stop_order(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().rev()
    }
}
