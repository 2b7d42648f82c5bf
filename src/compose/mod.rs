//! Compose file input
//!
//! Parsing, variable substitution, override-file merging and validation of
//! compose-style manifests.

pub mod config;
pub mod interpolate;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use interpolate::EnvSource;
pub use parser::ComposeParser;
