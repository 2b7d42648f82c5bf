//! muster - compose-style deployment orchestration
//!
//! muster reads a compose manifest and brings its services up in dependency
//! order. It provides:
//!
//! - Manifest parsing with variable substitution, override files and profiles
//! - Multi-stage build planning over a pluggable build backend
//! - Concurrent, dependency-gated startup with health probes
//! - Volume and network binding
//! - Watch mode that syncs, restarts or rebuilds services on file changes

pub mod compose;
pub mod error;
pub mod image;
pub mod manifest;
pub mod orchestrator;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod watch;

pub use error::{MusterError, Result};
