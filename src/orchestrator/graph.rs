//! Service dependency graph

use crate::error::{MusterError, Result};
use crate::manifest::{Dependency, Manifest};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// `depends_on` edges of the active services
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    edges: BTreeMap<String, Vec<Dependency>>,
}

impl ServiceGraph {
    /// Build the graph, rejecting cycles.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let edges = manifest
            .services
            .values()
            .map(|s| (s.name.clone(), s.depends_on.clone()))
            .collect();
        Self::new(edges)
    }

    /// Build from explicit edges, rejecting cycles and unknown services.
    pub fn new(edges: BTreeMap<String, Vec<Dependency>>) -> Result<Self> {
        let graph = Self { edges };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Service names
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Dependencies of `service`
    pub fn dependencies(&self, service: &str) -> &[Dependency] {
        self.edges.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Services with an edge to `service`
    pub fn dependents(&self, service: &str) -> Vec<(&str, &Dependency)> {
        self.edges
            .iter()
            .flat_map(|(name, deps)| {
                deps.iter()
                    .filter(|d| d.service == service)
                    .map(move |d| (name.as_str(), d))
            })
            .collect()
    }

    /// Deterministic start plan: waves of services whose dependencies are all
    /// in earlier waves, names sorted within a wave.
    pub fn start_plan(&self) -> StartPlan {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.as_str(),
                    deps.iter().map(|d| d.service.as_str()).collect(),
                )
            })
            .collect();

        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();
            if ready.is_empty() {
                // Unreachable for a checked graph
                break;
            }
            for name in &ready {
                remaining.remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            waves.push(ready.into_iter().map(str::to_string).collect());
        }

        StartPlan { waves }
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut visiting = Vec::new();

        for service in self.edges.keys() {
            self.visit(service, &mut visited, &mut visiting)?;
        }

        Ok(())
    }

    /// Depth-first walk; `visiting` holds the current path.
    fn visit(
        &self,
        service: &str,
        visited: &mut HashSet<String>,
        visiting: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(service) {
            return Ok(());
        }

        if let Some(pos) = visiting.iter().position(|s| s == service) {
            let mut cycle = visiting[pos..].to_vec();
            cycle.push(service.to_string());
            return Err(MusterError::CyclicDependency { cycle });
        }

        let deps = self.edges.get(service).ok_or_else(|| {
            MusterError::manifest(
                format!(
                    "services.{}.depends_on",
                    visiting.last().map(String::as_str).unwrap_or(service)
                ),
                format!("depends on unknown service '{}'", service),
            )
        })?;

        visiting.push(service.to_string());
        for dep in deps {
            self.visit(&dep.service, visited, visiting)?;
        }
        visiting.pop();
        visited.insert(service.to_string());

        Ok(())
    }
}

/// Ordered start plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartPlan {
    /// Services grouped into waves that may start in parallel
    pub waves: Vec<Vec<String>>,
}

impl StartPlan {
    /// Flattened order
    pub fn order(&self) -> Vec<&str> {
        self.waves.iter().flatten().map(String::as_str).collect()
    }
}

impl fmt::Display for StartPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "{:>3}. {}", i + 1, wave.join(", "))?;
        }
        Ok(())
    }
}
