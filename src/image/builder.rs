//! Image builder
//!
//! Services that build from the same file (same context and arguments) share
//! one [`BuildPlan`], so common ancestor stages are built once even when the
//! services target different stages. A failing stage only fails the services
//! whose target depends on it.

use super::backend::{BuildBackend, StageRequest};
use super::dockerfile::parse_build_file;
use super::stage::{BuildPlan, StageGraph};
use crate::error::{MusterError, Result};
use crate::manifest::{Manifest, Service};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Length of the digest suffix in generated image references
const DIGEST_PREFIX_LEN: usize = 12;

/// Plan for one build file
#[derive(Debug, Clone, Serialize)]
pub struct FilePlan {
    /// Build context directory
    pub context: PathBuf,
    /// Build file path
    pub dockerfile: PathBuf,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Stage plan covering every service target
    pub plan: BuildPlan,
    /// Service name to target stage
    pub services: BTreeMap<String, String>,
}

/// Result of a successful service build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltImage {
    /// Service
    pub service: String,
    /// Target stage
    pub target: String,
    /// Target stage digest
    pub digest: String,
    /// `<project>-<service>:<digest prefix>`
    pub reference: String,
}

/// Plans and runs builds through a [`BuildBackend`]
#[derive(Clone)]
pub struct ImageBuilder {
    /// Project name, used in image references
    project: String,
    /// Backend that executes stages
    backend: Arc<dyn BuildBackend>,
}

impl ImageBuilder {
    /// Create a new image builder
    pub fn new(project: &str, backend: Arc<dyn BuildBackend>) -> Self {
        Self {
            project: project.to_string(),
            backend,
        }
    }

    /// Plan every built service of the manifest, or only `only` when given.
    pub fn plan(manifest: &Manifest, only: &[String]) -> Result<Vec<FilePlan>> {
        for name in only {
            manifest.service(name)?;
        }

        let mut groups: BTreeMap<(PathBuf, PathBuf, Vec<(String, String)>), Vec<&Service>> =
            BTreeMap::new();
        for service in manifest.built_services() {
            if !only.is_empty() && !only.contains(&service.name) {
                continue;
            }
            if let Some(spec) = service.build() {
                let key = (
                    spec.dockerfile.clone(),
                    spec.context.clone(),
                    spec.args.clone().into_iter().collect(),
                );
                groups.entry(key).or_default().push(service);
            }
        }

        groups
            .into_values()
            .map(|services| Self::plan_services(&services))
            .collect()
    }

    /// Plan a single service
    pub fn plan_service(service: &Service) -> Result<FilePlan> {
        Self::plan_services(&[service])
    }

    /// Plan services sharing one build file
    fn plan_services(services: &[&Service]) -> Result<FilePlan> {
        let spec = services
            .first()
            .and_then(|s| s.build())
            .ok_or_else(|| MusterError::manifest("build", "no services to build"))?;

        let parsed = parse_build_file(&spec.dockerfile)?;
        let graph = StageGraph::from_build_file(&parsed)?;

        let mut targets = BTreeMap::new();
        for service in services {
            let target = service.build().and_then(|b| b.target.as_deref());
            targets.insert(service.name.clone(), graph.resolve_target(target)?);
        }

        let mut wanted: Vec<&str> = targets.values().map(String::as_str).collect();
        wanted.sort_unstable();
        wanted.dedup();
        let plan = BuildPlan::for_targets(&graph, &wanted)?;

        tracing::debug!(
            "Planned {} stages from {} for {} services",
            plan.len(),
            spec.dockerfile.display(),
            targets.len()
        );

        Ok(FilePlan {
            context: spec.context.clone(),
            dockerfile: spec.dockerfile.clone(),
            args: spec.args.clone(),
            plan,
            services: targets,
        })
    }

    /// Execute a file plan. Returns one result per service.
    pub async fn build(&self, file: &FilePlan) -> BTreeMap<String, Result<BuiltImage>> {
        let mut digests: HashMap<String, String> = HashMap::new();
        // failed stage -> (stage that originally failed, message)
        let mut failed: HashMap<String, (String, String)> = HashMap::new();

        for step in &file.plan.steps {
            let inputs: Vec<&str> = step
                .parent
                .iter()
                .chain(step.copy_from.iter())
                .map(String::as_str)
                .collect();

            if let Some(cause) = inputs.iter().find_map(|i| failed.get(*i).cloned()) {
                failed.insert(step.stage.clone(), cause);
                continue;
            }

            let service = file
                .services
                .iter()
                .find(|(_, target)| step.targets.contains(*target))
                .map(|(name, _)| name.clone())
                .unwrap_or_default();

            let request = StageRequest {
                service,
                context: file.context.clone(),
                dockerfile: file.dockerfile.clone(),
                step: step.clone(),
                inputs: inputs
                    .iter()
                    .filter_map(|i| digests.get(*i).cloned())
                    .collect(),
                args: file.args.clone(),
            };

            tracing::info!("Building stage {} ({})", step.stage, file.dockerfile.display());
            match self.backend.build_stage(&request).await {
                Ok(digest) => {
                    digests.insert(step.stage.clone(), digest);
                }
                Err(e) => {
                    tracing::warn!("Stage {} failed: {}", step.stage, e);
                    failed.insert(step.stage.clone(), (step.stage.clone(), e.to_string()));
                }
            }
        }

        file.services
            .iter()
            .map(|(service, target)| {
                let result = match (digests.get(target), failed.get(target)) {
                    (Some(digest), _) => Ok(BuiltImage {
                        service: service.clone(),
                        target: target.clone(),
                        digest: digest.clone(),
                        reference: self.reference(service, digest),
                    }),
                    (None, Some((stage, message))) => Err(MusterError::Build {
                        stage: stage.clone(),
                        service: service.clone(),
                        message: message.clone(),
                    }),
                    (None, None) => Err(MusterError::Build {
                        stage: target.clone(),
                        service: service.clone(),
                        message: "stage was not planned".to_string(),
                    }),
                };
                (service.clone(), result)
            })
            .collect()
    }

    /// Re-resolve and build one service
    pub async fn build_service(&self, service: &Service) -> Result<BuiltImage> {
        let file = Self::plan_service(service)?;
        self.build(&file)
            .await
            .remove(&service.name)
            .unwrap_or_else(|| Err(MusterError::ServiceNotFound(service.name.clone())))
    }

    fn reference(&self, service: &str, digest: &str) -> String {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let prefix = &hex[..hex.len().min(DIGEST_PREFIX_LEN)];
        format!("{}-{}:{}", self.project, service, prefix)
    }
}
