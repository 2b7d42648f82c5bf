//! Build stage graph and build plans

use super::dockerfile::ParsedBuildFile;
use crate::error::{MusterError, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// What a stage is based on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageBase {
    /// Another stage of the same file
    Stage(String),
    /// An external image reference
    Image(String),
}

/// A node of the stage graph
#[derive(Debug, Clone, Serialize)]
pub struct StageNode {
    /// Alias or positional index
    pub name: String,
    /// Base
    pub base: StageBase,
    /// Stages this one copies files from
    pub copy_from: Vec<String>,
    /// Opaque instruction text
    pub instructions: Vec<String>,
}

impl StageNode {
    /// Stages that must be built before this one
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        let parent = match &self.base {
            StageBase::Stage(name) => Some(name.as_str()),
            StageBase::Image(_) => None,
        };
        parent
            .into_iter()
            .chain(self.copy_from.iter().map(String::as_str))
    }
}

/// Explicit DAG of build stages
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageGraph {
    nodes: Vec<StageNode>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl StageGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of a parsed file.
    ///
    /// A `FROM` or `COPY --from` naming a stage declared later in the file is
    /// an [`MusterError::UnknownStage`]; names that match no stage are
    /// external images.
    pub fn from_build_file(parsed: &ParsedBuildFile) -> Result<Self> {
        let ids: Vec<String> = parsed.stages.iter().map(|s| s.id()).collect();
        let position = |name: &str| {
            parsed
                .stages
                .iter()
                .position(|s| s.name.as_deref() == Some(name))
                .or_else(|| name.parse::<usize>().ok().filter(|i| *i < ids.len()))
        };

        let mut graph = Self::new();
        for (i, stage) in parsed.stages.iter().enumerate() {
            let referenced_by = format!("stage '{}'", ids[i]);

            let base_key = stage.base.to_lowercase();
            let base = match parsed
                .stages
                .iter()
                .position(|s| s.name.as_deref() == Some(base_key.as_str()))
            {
                Some(j) if j < i => StageBase::Stage(ids[j].clone()),
                Some(_) => {
                    return Err(MusterError::UnknownStage {
                        stage: stage.base.clone(),
                        referenced_by,
                    })
                }
                None => StageBase::Image(stage.base.clone()),
            };

            let mut copy_from = Vec::new();
            for from in &stage.copy_from {
                match position(from) {
                    Some(j) if j < i => {
                        if !copy_from.contains(&ids[j]) {
                            copy_from.push(ids[j].clone());
                        }
                    }
                    Some(_) => {
                        return Err(MusterError::UnknownStage {
                            stage: from.clone(),
                            referenced_by,
                        })
                    }
                    None => {}
                }
            }

            graph.add_stage(StageNode {
                name: ids[i].clone(),
                base,
                copy_from,
                instructions: stage.instructions.iter().map(|i| i.to_string()).collect(),
            });
        }

        Ok(graph)
    }

    /// Add a stage. References are checked when a plan is built.
    pub fn add_stage(&mut self, node: StageNode) {
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
    }

    /// Stage by name
    pub fn get(&self, name: &str) -> Option<&StageNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Stages in declaration order
    pub fn stages(&self) -> &[StageNode] {
        &self.nodes
    }

    /// Name of the stage a build ends at: `target` when given, otherwise the
    /// last stage.
    pub fn resolve_target(&self, target: Option<&str>) -> Result<String> {
        match target {
            Some(t) => {
                let key = t.to_lowercase();
                if self.index.contains_key(&key) {
                    Ok(key)
                } else {
                    Err(MusterError::UnknownStage {
                        stage: t.to_string(),
                        referenced_by: "build target".to_string(),
                    })
                }
            }
            None => self
                .nodes
                .last()
                .map(|n| n.name.clone())
                .ok_or_else(|| MusterError::BuildFileParse {
                    line: 0,
                    message: "no stages".to_string(),
                }),
        }
    }
}

/// One stage of a plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Stage name
    pub stage: String,
    /// Parent stage, when based on one
    pub parent: Option<String>,
    /// External base image, when not based on a stage
    pub base_image: Option<String>,
    /// Extra stage inputs from `COPY --from`
    pub copy_from: Vec<String>,
    /// Opaque instruction text
    pub instructions: Vec<String>,
    /// Requested targets this step is an ancestor of (or equal to)
    pub targets: BTreeSet<String>,
}

/// Dependency-ordered list of stages to build
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildPlan {
    /// Steps; every step comes after the stages it depends on
    pub steps: Vec<PlanStep>,
}

impl BuildPlan {
    /// Plan the stages needed for every target. Shared ancestors appear once.
    pub fn for_targets(graph: &StageGraph, targets: &[&str]) -> Result<Self> {
        let mut plan = Self::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for target in targets {
            let target = graph.resolve_target(Some(target))?;
            let mut visiting = Vec::new();
            let mut visited = HashSet::new();
            plan.visit(
                graph,
                &target,
                &target,
                &mut visiting,
                &mut visited,
                &mut positions,
            )?;
        }

        Ok(plan)
    }

    /// Depth-first topological walk from `stage`
    fn visit(
        &mut self,
        graph: &StageGraph,
        stage: &str,
        target: &str,
        visiting: &mut Vec<String>,
        visited: &mut HashSet<String>,
        positions: &mut HashMap<String, usize>,
    ) -> Result<()> {
        if visited.contains(stage) {
            return Ok(());
        }

        if let Some(pos) = visiting.iter().position(|s| s == stage) {
            let mut cycle = visiting[pos..].to_vec();
            cycle.push(stage.to_string());
            return Err(MusterError::StageCycle { cycle });
        }

        let node = graph.get(stage).ok_or_else(|| MusterError::UnknownStage {
            stage: stage.to_string(),
            referenced_by: visiting
                .last()
                .map(|s| format!("stage '{}'", s))
                .unwrap_or_else(|| "build target".to_string()),
        })?;

        visiting.push(stage.to_string());
        for dep in node.dependencies() {
            self.visit(graph, dep, target, visiting, visited, positions)?;
        }
        visiting.pop();
        visited.insert(stage.to_string());

        match positions.get(stage) {
            Some(&i) => {
                self.steps[i].targets.insert(target.to_string());
            }
            None => {
                positions.insert(stage.to_string(), self.steps.len());
                let (parent, base_image) = match &node.base {
                    StageBase::Stage(s) => (Some(s.clone()), None),
                    StageBase::Image(img) => (None, Some(img.clone())),
                };
                self.steps.push(PlanStep {
                    stage: stage.to_string(),
                    parent,
                    base_image,
                    copy_from: node.copy_from.clone(),
                    instructions: node.instructions.clone(),
                    targets: BTreeSet::from([target.to_string()]),
                });
            }
        }

        Ok(())
    }

    /// Stage names in build order
    pub fn stage_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.stage.as_str()).collect()
    }

    /// Steps needed for one target, in build order
    pub fn steps_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a PlanStep> + 'a {
        self.steps.iter().filter(move |s| s.targets.contains(target))
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::dockerfile::parse_build_content;

    const DJANGO: &str = r#"
FROM python:3.12-slim AS base
WORKDIR /app

FROM base AS deps
RUN pip install poetry

FROM deps AS development
CMD ["python", "manage.py", "runserver"]

FROM deps AS production
COPY . .
CMD ["gunicorn", "server.wsgi"]
"#;

    fn graph(content: &str) -> StageGraph {
        StageGraph::from_build_file(&parse_build_content(content).unwrap()).unwrap()
    }

    fn node(name: &str, base: StageBase, copy_from: &[&str]) -> StageNode {
        StageNode {
            name: name.to_string(),
            base,
            copy_from: copy_from.iter().map(|s| s.to_string()).collect(),
            instructions: Vec::new(),
        }
    }

    #[test]
    fn test_plan_ends_at_target() {
        let g = graph(DJANGO);
        let plan = BuildPlan::for_targets(&g, &["production"]).unwrap();
        assert_eq!(plan.stage_names(), vec!["base", "deps", "production"]);
        assert_eq!(plan.steps[0].base_image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(plan.steps[1].parent.as_deref(), Some("base"));
    }

    #[test]
    fn test_shared_ancestors_appear_once() {
        let g = graph(DJANGO);
        let plan = BuildPlan::for_targets(&g, &["production", "development"]).unwrap();
        let names = plan.stage_names();
        assert_eq!(names.len(), 4);
        assert_eq!(names.iter().filter(|n| **n == "base").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "deps").count(), 1);
        assert_eq!(plan.steps[0].targets.len(), 2);
        assert_eq!(plan.steps_for("development").count(), 3);
    }

    #[test]
    fn test_default_target_is_last_stage() {
        let g = graph(DJANGO);
        assert_eq!(g.resolve_target(None).unwrap(), "production");
    }

    #[test]
    fn test_unknown_target() {
        let g = graph(DJANGO);
        let err = BuildPlan::for_targets(&g, &["staging"]).unwrap_err();
        assert!(matches!(err, MusterError::UnknownStage { ref stage, .. } if stage == "staging"));
    }

    #[test]
    fn test_forward_parent_reference_is_unknown_stage() {
        let parsed = parse_build_content("FROM later AS first\nFROM alpine AS later\n").unwrap();
        let err = StageGraph::from_build_file(&parsed).unwrap_err();
        assert!(matches!(err, MusterError::UnknownStage { .. }));
    }

    #[test]
    fn test_copy_from_adds_edge() {
        let g = graph(
            "FROM rust:1 AS build\nRUN cargo build\nFROM alpine AS assets\nFROM debian AS app\nCOPY --from=build /bin/app /app\nCOPY --from=0 /x /x\nCOPY --from=nginx:latest /etc/nginx /etc/nginx\n",
        );
        let plan = BuildPlan::for_targets(&g, &["app"]).unwrap();
        assert_eq!(plan.stage_names(), vec!["build", "app"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut g = StageGraph::new();
        g.add_stage(node("a", StageBase::Stage("c".into()), &[]));
        g.add_stage(node("b", StageBase::Stage("a".into()), &[]));
        g.add_stage(node("c", StageBase::Image("alpine".into()), &["b"]));
        let err = BuildPlan::for_targets(&g, &["c"]).unwrap_err();
        match err {
            MusterError::StageCycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_parent_in_programmatic_graph() {
        let mut g = StageGraph::new();
        g.add_stage(node("app", StageBase::Stage("ghost".into()), &[]));
        let err = BuildPlan::for_targets(&g, &["app"]).unwrap_err();
        assert!(matches!(err, MusterError::UnknownStage { ref stage, .. } if stage == "ghost"));
    }
}
