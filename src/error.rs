//! Error types for muster

use thiserror::Error;

/// Result type for muster operations
pub type Result<T> = std::result::Result<T, MusterError>;

/// muster error types
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("manifest error in {context}: {message}")]
    Manifest { context: String, message: String },

    #[error("cyclic service dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("cyclic build stage reference: {}", cycle.join(" -> "))]
    StageCycle { cycle: Vec<String> },

    #[error("build file parse error at line {line}: {message}")]
    BuildFileParse { line: usize, message: String },

    #[error("unknown build stage '{stage}' referenced by {referenced_by}")]
    UnknownStage { stage: String, referenced_by: String },

    #[error("service '{service}' references undeclared {kind} '{name}'")]
    UnboundResource {
        service: String,
        kind: &'static str,
        name: String,
    },

    #[error("service '{service}' became unhealthy after {retries} consecutive failed probes")]
    HealthExhausted { service: String, retries: u32 },

    #[error("build of stage '{stage}' for service '{service}' failed: {message}")]
    Build {
        stage: String,
        service: String,
        message: String,
    },

    #[error("service '{service}' failed to start: {message}")]
    Start { service: String, message: String },

    #[error("service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: String,
        to: String,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl MusterError {
    /// Shorthand for a manifest error
    pub fn manifest(context: impl Into<String>, message: impl Into<String>) -> Self {
        MusterError::Manifest {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error class.
    ///
    /// Build, cycle and health failures get distinct codes so scripts can
    /// tell them apart.
    pub fn exit_code(&self) -> u8 {
        match self {
            MusterError::Manifest { .. } | MusterError::Yaml(_) => 1,
            MusterError::CyclicDependency { .. } | MusterError::StageCycle { .. } => 2,
            MusterError::BuildFileParse { .. }
            | MusterError::UnknownStage { .. }
            | MusterError::Build { .. } => 3,
            MusterError::HealthExhausted { .. } => 4,
            MusterError::UnboundResource { .. }
            | MusterError::Start { .. }
            | MusterError::ServiceNotFound(_) => 5,
            MusterError::InvalidTransition { .. }
            | MusterError::Io(_)
            | MusterError::Json(_)
            | MusterError::Watch(_)
            | MusterError::Lock(_) => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_failure_classes() {
        let cycle = MusterError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        let build = MusterError::Build {
            stage: "base".into(),
            service: "web".into(),
            message: "boom".into(),
        };
        let health = MusterError::HealthExhausted {
            service: "db".into(),
            retries: 5,
        };

        assert_eq!(cycle.exit_code(), 2);
        assert_eq!(build.exit_code(), 3);
        assert_eq!(health.exit_code(), 4);
        assert_eq!(cycle.to_string(), "cyclic service dependency: a -> b -> a");
    }
}
