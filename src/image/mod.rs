//! Build stage resolution
//!
//! This module parses multi-stage build files into an explicit stage graph,
//! turns requested targets into dependency-ordered build plans and runs those
//! plans through a pluggable build backend.

pub mod backend;
pub mod builder;
pub mod dockerfile;
pub mod stage;

pub use backend::{BuildBackend, DigestBuildBackend, StageRequest};
pub use builder::{BuiltImage, FilePlan, ImageBuilder};
pub use stage::{BuildPlan, PlanStep, StageGraph};
