//! Watch mode
//!
//! Keeps running services in step with the project directory while `up`
//! stays attached.

pub mod fs;
pub mod glob;
pub mod reconciler;

pub use fs::FsWatcher;
pub use glob::PathMatcher;
pub use reconciler::{Action, ActionSink, Reconciler, DEFAULT_DEBOUNCE};
