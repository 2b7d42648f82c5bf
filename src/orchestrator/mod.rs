//! Service orchestration
//!
//! Dependency ordering, startup, health gating and teardown of the services
//! in a resolved manifest.

pub mod graph;
pub mod health;
pub mod scheduler;
pub mod state;
pub mod status;

pub use graph::{ServiceGraph, StartPlan};
pub use health::{HealthGate, HealthOutcome};
pub use scheduler::{Orchestrator, ServiceFailure, UpReport};
pub use state::RunState;
pub use status::{Readiness, ServiceStatus, StatusBoard, StatusEvent};
