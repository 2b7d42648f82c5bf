//! Resolved manifest
//!
//! A [`Manifest`] is the validated, profile-applied model of one orchestration
//! run. It is built once from a [`ComposeConfig`] and shared read-only
//! (usually behind an `Arc`) by the scheduler, health gate, binder and watch
//! reconciler.

pub mod duration;
pub mod service;

pub use service::{
    BuildSpec, Command, Dependency, DependencyCondition, HealthProbe, ImageSource, MountKind,
    MountSpec, PortBinding, Service, WatchAction, WatchRule, DEFAULT_STOP_GRACE,
};

use crate::compose::config::ComposeConfig;
use crate::compose::ComposeParser;
use crate::error::{MusterError, Result};
use crate::orchestrator::ServiceGraph;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Name of the profile used when none is requested
pub const DEFAULT_PROFILE: &str = "default";

/// The active profile of a run
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    /// Profile name
    pub name: String,
    /// Build target applied to every built service
    pub target: Option<String>,
    /// Whether watch rules are active
    pub watch: bool,
}

/// A declared named volume
#[derive(Debug, Clone, Serialize)]
pub struct VolumeDecl {
    /// Volume name
    pub name: String,
    /// Host directory backing the volume (`driver_opts` bind device)
    pub device: Option<PathBuf>,
    /// Managed outside this project
    pub external: bool,
    /// Active services mounting this volume
    pub services: BTreeSet<String>,
}

/// A declared network
#[derive(Debug, Clone, Serialize)]
pub struct NetworkDecl {
    /// Network name
    pub name: String,
    /// Managed outside this project
    pub external: bool,
    /// No outside connectivity
    pub internal: bool,
    /// Active services attached to this network
    pub services: BTreeSet<String>,
}

/// Validated model of one run
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    /// Project name
    pub project: String,
    /// Directory relative paths are resolved against
    pub project_dir: PathBuf,
    /// Active profile
    pub profile: Profile,
    /// Active services
    pub services: BTreeMap<String, Service>,
    /// Declared volumes used by active services
    pub volumes: BTreeMap<String, VolumeDecl>,
    /// Declared networks, plus the implicit `default`
    pub networks: BTreeMap<String, NetworkDecl>,
    /// Non-fatal findings from validation
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Manifest {
    /// Apply `profile` to `config` and produce the active model.
    pub fn resolve(
        config: &ComposeConfig,
        profile: &str,
        project_dir: &Path,
        project: &str,
    ) -> Result<Self> {
        let overlay = config.profiles.get(profile);
        let known_by_service = config
            .services
            .values()
            .any(|s| s.profiles.iter().flatten().any(|p| p == profile));
        if profile != DEFAULT_PROFILE && overlay.is_none() && !known_by_service {
            return Err(MusterError::manifest(
                "profiles",
                format!("unknown profile '{}'", profile),
            ));
        }

        let mut config = config.clone();
        if let Some(overlay) = overlay {
            for (name, overrides) in &overlay.services {
                if let Some(service) = config.services.get_mut(name) {
                    service.merge(overrides.clone());
                }
            }
        }
        let warnings = ComposeParser::validate(&config)?;

        let is_active = |name: &str| {
            config
                .services
                .get(name)
                .map(|s| match &s.profiles {
                    Some(list) if !list.is_empty() => list.iter().any(|p| p == profile),
                    _ => true,
                })
                .unwrap_or(false)
        };

        let profile = Profile {
            name: profile.to_string(),
            target: overlay.and_then(|o| o.target.clone()),
            watch: overlay.and_then(|o| o.watch).unwrap_or(true),
        };

        let mut services = BTreeMap::new();
        for (name, service_config) in &config.services {
            if !is_active(name.as_str()) {
                tracing::debug!("Service {} not in profile {}", name, profile.name);
                continue;
            }

            let mut service = Service::from_config(
                name,
                service_config,
                project_dir,
                profile.target.as_deref(),
                profile.watch,
            )?;

            let mut kept = Vec::with_capacity(service.depends_on.len());
            for dep in service.depends_on.drain(..) {
                if is_active(dep.service.as_str()) {
                    kept.push(dep);
                } else if dep.required {
                    return Err(MusterError::manifest(
                        format!("services.{}.depends_on", name),
                        format!(
                            "depends on '{}', which is not active in profile '{}'",
                            dep.service, profile.name
                        ),
                    ));
                }
            }
            service.depends_on = kept;

            services.insert(name.clone(), service);
        }

        for service in services.values() {
            for dep in &service.depends_on {
                let probed = services
                    .get(&dep.service)
                    .map(|d| d.healthcheck.is_some())
                    .unwrap_or(true);
                if dep.condition == DependencyCondition::Healthy && !probed {
                    return Err(MusterError::manifest(
                        format!("services.{}.depends_on.{}", service.name, dep.service),
                        format!(
                            "'{}' requires '{}' to be healthy, but '{}' has no healthcheck",
                            service.name, dep.service, dep.service
                        ),
                    ));
                }
            }
        }

        let mut volumes = BTreeMap::new();
        for (name, decl) in &config.volumes {
            let attached: BTreeSet<String> = services
                .values()
                .filter(|s| {
                    s.mounts
                        .iter()
                        .any(|m| matches!(&m.kind, MountKind::Volume { name: v } if v == name))
                })
                .map(|s| s.name.clone())
                .collect();
            if attached.is_empty() {
                continue;
            }
            let decl = decl.clone().unwrap_or_default();
            volumes.insert(
                name.clone(),
                VolumeDecl {
                    name: decl.name.clone().unwrap_or_else(|| name.clone()),
                    device: decl.bind_device().map(|d| {
                        let path = Path::new(d);
                        if path.is_absolute() {
                            path.to_path_buf()
                        } else {
                            project_dir.join(path)
                        }
                    }),
                    external: decl.external.unwrap_or(false),
                    services: attached,
                },
            );
        }

        let mut networks: BTreeMap<String, NetworkDecl> = BTreeMap::new();
        networks.insert(
            "default".to_string(),
            NetworkDecl {
                name: format!("{}_default", project),
                external: false,
                internal: false,
                services: BTreeSet::new(),
            },
        );
        for (name, decl) in &config.networks {
            let decl = decl.clone().unwrap_or_default();
            networks.insert(
                name.clone(),
                NetworkDecl {
                    name: decl.name.unwrap_or_else(|| format!("{}_{}", project, name)),
                    external: decl.external.unwrap_or(false),
                    internal: decl.internal.unwrap_or(false),
                    services: BTreeSet::new(),
                },
            );
        }
        for service in services.values() {
            for net in &service.networks {
                if let Some(decl) = networks.get_mut(net) {
                    decl.services.insert(service.name.clone());
                }
            }
        }

        let manifest = Self {
            project: project.to_string(),
            project_dir: project_dir.to_path_buf(),
            profile,
            services,
            volumes,
            networks,
            warnings,
        };
        ServiceGraph::from_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Look up an active service
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| MusterError::ServiceNotFound(name.to_string()))
    }

    /// Active services that are built locally
    pub fn built_services(&self) -> impl Iterator<Item = &Service> {
        self.services.values().filter(|s| s.build().is_some())
    }

    /// All active watch rules
    pub fn watch_rules(&self) -> Vec<WatchRule> {
        self.services
            .values()
            .flat_map(|s| s.watch.iter().cloned())
            .collect()
    }

}

/// Compose-compatible project name: lowercase alphanumerics, `-` and `_`.
pub fn normalize_project_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let name = name.trim_start_matches(['-', '_']).to_string();
    if name.is_empty() {
        "default".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::EnvSource;

    const DJANGO: &str = r#"
name: shop
services:
  db:
    image: postgres:16
    volumes:
      - pgdata:/var/lib/postgresql/data
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
      interval: 5s
      timeout: 5s
      retries: 5
  web:
    build:
      context: ./backend
      target: production
    depends_on:
      db:
        condition: service_healthy
    volumes:
      - static_volume:/app/staticfiles
    develop:
      watch:
        - action: sync
          path: ./backend
          target: /app
          ignore: ["*.pyc"]
        - action: rebuild
          path: ./backend/poetry.lock
  debugger:
    image: busybox
    profiles: ["dev"]
volumes:
  pgdata:
  static_volume:
    driver: local
    driver_opts:
      type: none
      o: bind
      device: ./static
x-profiles:
  dev:
    target: development
    services:
      web:
        command: python manage.py runserver 0.0.0.0:8000
  prod:
    watch: false
"#;

    fn config() -> ComposeConfig {
        ComposeParser::parse_str(DJANGO, &EnvSource::new()).unwrap()
    }

    #[test]
    fn test_default_profile() {
        let manifest = Manifest::resolve(&config(), DEFAULT_PROFILE, Path::new("/p"), "shop")
            .unwrap();
        assert_eq!(manifest.services.len(), 2);
        assert!(!manifest.services.contains_key("debugger"));
        let web = manifest.service("web").unwrap();
        assert_eq!(web.build().unwrap().target.as_deref(), Some("production"));
        assert_eq!(web.watch.len(), 2);
        assert_eq!(
            manifest.volumes["static_volume"].device,
            Some(PathBuf::from("/p/static"))
        );
        assert!(manifest.volumes["pgdata"].services.contains("db"));
        assert!(manifest.networks["default"].services.contains("web"));
    }

    #[test]
    fn test_dev_profile_overrides_target_and_command() {
        let manifest = Manifest::resolve(&config(), "dev", Path::new("/p"), "shop").unwrap();
        assert!(manifest.services.contains_key("debugger"));
        let web = manifest.service("web").unwrap();
        assert_eq!(web.build().unwrap().target.as_deref(), Some("development"));
        assert!(matches!(web.command, Some(Command::Shell(ref s)) if s.contains("runserver")));
    }

    #[test]
    fn test_profile_can_disable_watch() {
        let manifest = Manifest::resolve(&config(), "prod", Path::new("/p"), "shop").unwrap();
        assert!(manifest.watch_rules().is_empty());
    }

    #[test]
    fn test_unknown_profile() {
        let err = Manifest::resolve(&config(), "staging", Path::new("/p"), "shop").unwrap_err();
        assert!(err.to_string().contains("unknown profile"));
    }

    #[test]
    fn test_dependency_on_inactive_service() {
        let yaml = r#"
services:
  web:
    image: app
    depends_on: [tools]
  tools:
    image: busybox
    profiles: ["debug"]
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let err = Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "x").unwrap_err();
        assert!(err.to_string().contains("not active"), "{err}");
        assert!(Manifest::resolve(&config, "debug", Path::new("/p"), "x").is_ok());
    }

    #[test]
    fn test_optional_dependency_on_inactive_service_is_dropped() {
        let yaml = r#"
services:
  web:
    image: app
    depends_on:
      tools:
        condition: service_started
        required: false
  tools:
    image: busybox
    profiles: ["debug"]
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let manifest = Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "x").unwrap();
        assert!(manifest.service("web").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_healthy_condition_requires_healthcheck() {
        let yaml = r#"
services:
  db:
    image: postgres
  web:
    image: app
    depends_on:
      db:
        condition: service_healthy
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let err = Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "x").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let msg = err.to_string();
        assert!(msg.contains("web") && msg.contains("db"), "{msg}");
        assert!(msg.contains("no healthcheck"), "{msg}");
    }

    #[test]
    fn test_healthy_condition_on_disabled_healthcheck() {
        let yaml = r#"
services:
  db:
    image: postgres
    healthcheck:
      disable: true
  web:
    image: app
    depends_on:
      db:
        condition: service_healthy
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let err = Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "x").unwrap_err();
        assert!(err.to_string().contains("no healthcheck"), "{err}");
    }

    #[test]
    fn test_cycle_rejected_at_resolve() {
        let yaml = r#"
services:
  a:
    image: busybox
    depends_on: [b]
  b:
    image: busybox
    depends_on: [a]
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let err = Manifest::resolve(&config, DEFAULT_PROFILE, Path::new("/p"), "x").unwrap_err();
        assert!(matches!(err, MusterError::CyclicDependency { .. }), "{err}");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_normalize_project_name() {
        assert_eq!(normalize_project_name("My Shop.App"), "myshopapp");
        assert_eq!(normalize_project_name("__x-y"), "x-y");
        assert_eq!(normalize_project_name("!!!"), "default");
    }

    #[test]
    fn test_env_file_loaded_before_inline_environment() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("web.env"), "A=file\nB=file\n").unwrap();
        let yaml = r#"
services:
  web:
    image: app
    env_file: web.env
    environment:
      B: inline
"#;
        let config = ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap();
        let manifest = Manifest::resolve(&config, DEFAULT_PROFILE, temp.path(), "x").unwrap();
        let env = &manifest.service("web").unwrap().environment;
        assert_eq!(env["A"], "file");
        assert_eq!(env["B"], "inline");
    }
}
