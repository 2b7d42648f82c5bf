//! Build backends
//!
//! A backend executes one planned stage at a time and returns the stage's
//! content digest. Layer construction lives entirely behind this trait.

use super::stage::PlanStep;
use crate::error::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything a backend needs to build one stage
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Service the build was requested for
    pub service: String,
    /// Build context directory
    pub context: PathBuf,
    /// Build file
    pub dockerfile: PathBuf,
    /// Stage to build
    pub step: PlanStep,
    /// Digests of the parent stage and `COPY --from` stages, in order
    pub inputs: Vec<String>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
}

/// Executes build stages
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Build one stage, returning its digest
    async fn build_stage(&self, request: &StageRequest) -> Result<String>;
}

/// Backend that performs no work and derives a deterministic digest from the
/// stage definition and its inputs.
#[derive(Debug, Default, Clone)]
pub struct DigestBuildBackend;

impl DigestBuildBackend {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }

    /// Digest of a stage definition
    pub fn digest(request: &StageRequest) -> String {
        let mut hasher = Sha256::new();
        for input in &request.inputs {
            hasher.update(b"input:");
            hasher.update(input.as_bytes());
            hasher.update(b"\n");
        }
        if let Some(base) = &request.step.base_image {
            hasher.update(b"from:");
            hasher.update(base.as_bytes());
            hasher.update(b"\n");
        }
        for instruction in &request.step.instructions {
            hasher.update(instruction.as_bytes());
            hasher.update(b"\n");
        }
        for (key, value) in &request.args {
            hasher.update(format!("arg:{}={}\n", key, value).as_bytes());
        }
        format!("sha256:{:x}", hasher.finalize())
    }
}

#[async_trait]
impl BuildBackend for DigestBuildBackend {
    async fn build_stage(&self, request: &StageRequest) -> Result<String> {
        let digest = Self::digest(request);
        tracing::debug!(
            "Stage {} of {} -> {}",
            request.step.stage,
            request.dockerfile.display(),
            digest
        );
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn request(instructions: &[&str], inputs: &[&str]) -> StageRequest {
        StageRequest {
            service: "web".into(),
            context: PathBuf::from("/p"),
            dockerfile: PathBuf::from("/p/Dockerfile"),
            step: PlanStep {
                stage: "base".into(),
                parent: None,
                base_image: Some("python:3.12".into()),
                copy_from: Vec::new(),
                instructions: instructions.iter().map(|s| s.to_string()).collect(),
                targets: BTreeSet::new(),
            },
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            args: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_digest_is_deterministic() {
        let backend = DigestBuildBackend::new();
        let a = backend.build_stage(&request(&["RUN true"], &[])).await.unwrap();
        let b = backend.build_stage(&request(&["RUN true"], &[])).await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_digest_covers_inputs_and_instructions() {
        let base = DigestBuildBackend::digest(&request(&["RUN true"], &[]));
        assert_ne!(base, DigestBuildBackend::digest(&request(&["RUN false"], &[])));
        assert_ne!(base, DigestBuildBackend::digest(&request(&["RUN true"], &["sha256:aa"])));
    }
}
