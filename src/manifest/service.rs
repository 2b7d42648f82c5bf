//! Checked service model

use super::duration::parse_duration;
use crate::compose::config::{
    CommandConfig, DependsOnConfig, HealthcheckConfig, HealthcheckTest, PortConfig,
    ServiceConfig, VolumeMount, WatchActionConfig,
};
use crate::error::{MusterError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default grace period between a stop request and a forced kill
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// One service of the active profile
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Where the image comes from
    pub source: ImageSource,
    /// Command
    pub command: Option<Command>,
    /// Entrypoint
    pub entrypoint: Option<Command>,
    /// Dependencies in declaration order
    pub depends_on: Vec<Dependency>,
    /// Readiness probe
    pub healthcheck: Option<HealthProbe>,
    /// Published ports
    pub ports: Vec<PortBinding>,
    /// Ports exposed to other services only
    pub expose: Vec<String>,
    /// Volume mounts, not yet bound
    pub mounts: Vec<MountSpec>,
    /// Final environment (env files, then inline values)
    pub environment: BTreeMap<String, String>,
    /// Network memberships
    pub networks: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Time allowed for a graceful stop
    #[serde(with = "duration_secs")]
    pub stop_grace_period: Duration,
    /// Active watch rules
    pub watch: Vec<WatchRule>,
}

impl Service {
    /// Build the checked model from raw configuration.
    ///
    /// `target_override` is the profile-wide build target, which wins over the
    /// service's own `build.target`.
    pub fn from_config(
        name: &str,
        config: &ServiceConfig,
        project_dir: &Path,
        target_override: Option<&str>,
        watch_enabled: bool,
    ) -> Result<Self> {
        let context = format!("services.{}", name);

        let source = match (&config.build, &config.image) {
            (Some(build), image) => {
                let context_dir = project_dir.join(build.context());
                let dockerfile = context_dir.join(build.dockerfile().unwrap_or("Dockerfile"));
                let target = target_override
                    .or(build.target())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                let args = match build {
                    crate::compose::config::BuildConfig::Full(full) => full
                        .args
                        .iter()
                        .flatten()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect(),
                    crate::compose::config::BuildConfig::Simple(_) => BTreeMap::new(),
                };
                ImageSource::Build(BuildSpec {
                    context: context_dir,
                    dockerfile,
                    target,
                    args,
                    tag: image.clone(),
                })
            }
            (None, Some(image)) => ImageSource::Image(image.clone()),
            (None, None) => {
                return Err(MusterError::manifest(
                    context,
                    "service must have either 'image' or 'build' specified",
                ))
            }
        };

        let mut environment = BTreeMap::new();
        if let Some(env_file) = &config.env_file {
            for file in env_file.paths() {
                let path = project_dir.join(file);
                if !path.is_file() {
                    return Err(MusterError::manifest(
                        format!("{}.env_file", context),
                        format!("cannot read {}", path.display()),
                    ));
                }
                environment.extend(crate::compose::interpolate::read_dotenv(&path)?);
            }
        }
        if let Some(env) = &config.environment {
            environment.extend(env.to_pairs());
        }

        let depends_on = match &config.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(names)) => names
                .iter()
                .map(|dep| Dependency {
                    service: dep.clone(),
                    condition: DependencyCondition::Started,
                    required: true,
                    restart: false,
                })
                .collect(),
            Some(DependsOnConfig::Map(map)) => map
                .iter()
                .map(|(dep, cond)| {
                    let condition = match cond.condition.as_deref() {
                        Some("service_healthy") => DependencyCondition::Healthy,
                        _ => DependencyCondition::Started,
                    };
                    Dependency {
                        service: dep.clone(),
                        condition,
                        required: cond.required.unwrap_or(true),
                        restart: cond.restart.unwrap_or(false),
                    }
                })
                .collect(),
        };

        let healthcheck = match &config.healthcheck {
            Some(hc) => HealthProbe::from_config(hc, &format!("{}.healthcheck", context))?,
            None => None,
        };

        let ports = config
            .ports
            .iter()
            .flatten()
            .map(|p| PortBinding::from_config(p, &context))
            .collect::<Result<Vec<_>>>()?;

        let expose = config
            .expose
            .iter()
            .flatten()
            .map(|v| v.to_string())
            .collect();

        let mounts = config
            .volumes
            .iter()
            .flatten()
            .map(|m| MountSpec::from_config(m, project_dir, &context))
            .collect::<Result<Vec<_>>>()?;

        let networks = match &config.networks {
            Some(networks) => networks.names(),
            None => vec!["default".to_string()],
        };

        let stop_grace_period = match &config.stop_grace_period {
            Some(s) => parse_duration(s)
                .map_err(|msg| MusterError::manifest(format!("{}.stop_grace_period", context), msg))?,
            None => DEFAULT_STOP_GRACE,
        };

        let watch = if watch_enabled {
            config
                .develop
                .iter()
                .flat_map(|d| d.watch.iter())
                .map(|rule| WatchRule {
                    service: name.to_string(),
                    action: match rule.action {
                        WatchActionConfig::Sync => WatchAction::Sync,
                        WatchActionConfig::SyncRestart => WatchAction::SyncRestart,
                        WatchActionConfig::Rebuild => WatchAction::Rebuild,
                    },
                    path: rule.path.clone(),
                    target: rule.target.clone(),
                    ignore: rule.ignore.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            name: name.to_string(),
            source,
            command: config.command.as_ref().map(Command::from),
            entrypoint: config.entrypoint.as_ref().map(Command::from),
            depends_on,
            healthcheck,
            ports,
            expose,
            mounts,
            environment,
            networks,
            working_dir: config.working_dir.clone(),
            stop_grace_period,
            watch,
        })
    }

    /// Build spec, when the image is built locally
    pub fn build(&self) -> Option<&BuildSpec> {
        match &self.source {
            ImageSource::Build(spec) => Some(spec),
            ImageSource::Image(_) => None,
        }
    }

    /// Full argv: entrypoint followed by command
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(ep) = &self.entrypoint {
            argv.extend(ep.argv());
        }
        if let Some(cmd) = &self.command {
            argv.extend(cmd.argv());
        }
        argv
    }
}

/// Image origin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Pre-built image reference
    Image(String),
    /// Built from a local build file
    Build(BuildSpec),
}

/// Resolved build inputs
#[derive(Debug, Clone, Serialize)]
pub struct BuildSpec {
    /// Absolute context directory
    pub context: PathBuf,
    /// Absolute build file path
    pub dockerfile: PathBuf,
    /// Target stage; the last stage when unset
    pub target: Option<String>,
    /// Build arguments
    pub args: BTreeMap<String, String>,
    /// Tag to apply, when `image` is set alongside `build`
    pub tag: Option<String>,
}

/// Command in shell or exec form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Run through `/bin/sh -c`
    Shell(String),
    /// Run directly
    Exec(Vec<String>),
}

impl Command {
    /// Arguments to execute
    pub fn argv(&self) -> Vec<String> {
        match self {
            Command::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            Command::Exec(args) => args.clone(),
        }
    }
}

impl From<&CommandConfig> for Command {
    fn from(cmd: &CommandConfig) -> Self {
        match cmd {
            CommandConfig::Shell(s) => Command::Shell(s.clone()),
            CommandConfig::Exec(args) => Command::Exec(args.clone()),
        }
    }
}

/// Readiness a dependency must reach before the dependent starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Process started
    Started,
    /// Health probe passed
    Healthy,
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyCondition::Started => write!(f, "service_started"),
            DependencyCondition::Healthy => write!(f, "service_healthy"),
        }
    }
}

/// A `depends_on` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Service depended upon
    pub service: String,
    /// Condition to wait for
    pub condition: DependencyCondition,
    /// When false, a failed dependency does not block the dependent
    pub required: bool,
    /// Restart the dependent when the dependency restarts
    pub restart: bool,
}

/// Health probe policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthProbe {
    /// Probe command
    pub test: Command,
    /// Time between probe starts
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Upper bound on a single probe
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Consecutive failures before the service is unhealthy (at least 1)
    pub retries: u32,
    /// Grace period during which failures are not counted
    #[serde(with = "duration_secs")]
    pub start_period: Duration,
}

impl HealthProbe {
    /// Defaults used when a field is absent
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Convert raw config; `Ok(None)` when the check is disabled.
    pub fn from_config(config: &HealthcheckConfig, context: &str) -> Result<Option<Self>> {
        if config.disable.unwrap_or(false) {
            return Ok(None);
        }

        let test = match &config.test {
            None => return Ok(None),
            Some(HealthcheckTest::Command(s)) => Command::Shell(s.clone()),
            Some(HealthcheckTest::Array(parts)) => match parts.split_first() {
                Some((kind, _)) if kind == "NONE" => return Ok(None),
                Some((kind, rest)) if kind == "CMD-SHELL" => Command::Shell(rest.join(" ")),
                Some((kind, rest)) if kind == "CMD" => Command::Exec(rest.to_vec()),
                _ => {
                    return Err(MusterError::manifest(
                        context,
                        "test must start with CMD, CMD-SHELL or NONE",
                    ))
                }
            },
        };

        let duration = |value: &Option<String>, default: Duration| -> Result<Duration> {
            match value {
                Some(s) => parse_duration(s).map_err(|msg| MusterError::manifest(context, msg)),
                None => Ok(default),
            }
        };

        let retries = config.retries.unwrap_or(Self::DEFAULT_RETRIES);
        if retries == 0 {
            return Err(MusterError::manifest(context, "retries must be at least 1"));
        }

        Ok(Some(Self {
            test,
            interval: duration(&config.interval, Self::DEFAULT_INTERVAL)?,
            timeout: duration(&config.timeout, Self::DEFAULT_TIMEOUT)?,
            retries,
            start_period: duration(&config.start_period, Duration::ZERO)?,
        }))
    }
}

/// Published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    /// Host interface
    pub host_ip: Option<String>,
    /// Host port or range
    pub published: Option<String>,
    /// Port inside the service
    pub target: u16,
    /// tcp or udp
    pub protocol: String,
}

impl PortBinding {
    fn from_config(config: &PortConfig, context: &str) -> Result<Self> {
        match config {
            PortConfig::Number(port) => Ok(Self {
                host_ip: None,
                published: None,
                target: *port,
                protocol: "tcp".to_string(),
            }),
            PortConfig::Long(long) => Ok(Self {
                host_ip: long.host_ip.clone(),
                published: long.published.as_ref().map(|p| p.to_string()),
                target: long.target,
                protocol: long.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
            }),
            PortConfig::Short(spec) => Self::parse_short(spec).ok_or_else(|| {
                MusterError::manifest(format!("{}.ports", context), format!("invalid port '{}'", spec))
            }),
        }
    }

    /// `[[host_ip:]published:]target[/protocol]`
    fn parse_short(spec: &str) -> Option<Self> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((p, proto)) => (p, proto.to_string()),
            None => (spec, "tcp".to_string()),
        };
        let parts: Vec<&str> = ports.rsplitn(3, ':').collect();
        let target = parts.first()?.parse().ok()?;
        Some(Self {
            host_ip: parts.get(2).map(|s| s.to_string()),
            published: parts.get(1).map(|s| s.to_string()),
            target,
            protocol,
        })
    }
}

/// Mount source kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum MountKind {
    /// Named volume
    Volume { name: String },
    /// Host directory
    Bind {
        source: PathBuf,
        create_host_path: bool,
    },
    /// Anonymous volume
    Anonymous,
    /// In-memory filesystem
    Tmpfs,
}

/// A volume mount as declared on the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    /// Source
    pub kind: MountKind,
    /// Path inside the service
    pub target: String,
    /// Mounted read only
    pub read_only: bool,
}

impl MountSpec {
    fn from_config(config: &VolumeMount, project_dir: &Path, context: &str) -> Result<Self> {
        match config {
            VolumeMount::Short(spec) => Self::parse_short(spec, project_dir).ok_or_else(|| {
                MusterError::manifest(
                    format!("{}.volumes", context),
                    format!("invalid volume '{}'", spec),
                )
            }),
            VolumeMount::Long(long) => {
                let kind = match (long.mount_type.as_deref(), &long.source) {
                    (Some("bind"), Some(src)) => MountKind::Bind {
                        source: resolve_host_path(src, project_dir),
                        create_host_path: long
                            .bind
                            .as_ref()
                            .and_then(|b| b.create_host_path)
                            .unwrap_or(true),
                    },
                    (Some("tmpfs"), _) => MountKind::Tmpfs,
                    (Some("volume") | None, Some(src)) => MountKind::Volume { name: src.clone() },
                    (Some("volume") | None, None) => MountKind::Anonymous,
                    (Some(other), _) => {
                        return Err(MusterError::manifest(
                            format!("{}.volumes", context),
                            format!("unsupported mount type '{}'", other),
                        ))
                    }
                };
                Ok(Self {
                    kind,
                    target: long.target.clone(),
                    read_only: long.read_only.unwrap_or(false),
                })
            }
        }
    }

    fn parse_short(spec: &str, project_dir: &Path) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [target] if !target.is_empty() => Some(Self {
                kind: MountKind::Anonymous,
                target: target.to_string(),
                read_only: false,
            }),
            [source, target, rest @ ..] if rest.len() <= 1 && !source.is_empty() => {
                let read_only = rest
                    .first()
                    .map(|mode| mode.split(',').any(|m| m == "ro"))
                    .unwrap_or(false);
                let kind = if is_host_path(source) {
                    MountKind::Bind {
                        source: resolve_host_path(source, project_dir),
                        create_host_path: true,
                    }
                } else {
                    MountKind::Volume {
                        name: source.to_string(),
                    }
                };
                Some(Self {
                    kind,
                    target: target.to_string(),
                    read_only,
                })
            }
            _ => None,
        }
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

fn resolve_host_path(source: &str, project_dir: &Path) -> PathBuf {
    if let Some(rest) = source.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

/// What a watch rule does on a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchAction {
    /// Copy the changed path into the running service
    Sync,
    /// Copy, then restart the service
    SyncRestart,
    /// Rebuild the image and restart the service
    Rebuild,
}

impl std::fmt::Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchAction::Sync => write!(f, "sync"),
            WatchAction::SyncRestart => write!(f, "sync+restart"),
            WatchAction::Rebuild => write!(f, "rebuild"),
        }
    }
}

/// A `develop.watch` rule of an active service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchRule {
    /// Owning service
    pub service: String,
    /// Action to enqueue
    pub action: WatchAction,
    /// Watched path or glob, relative to the project directory
    pub path: String,
    /// Destination inside the service
    pub target: Option<String>,
    /// Ignore patterns
    pub ignore: Vec<String>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(yaml: &str) -> Result<Service> {
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        Service::from_config("web", &config, Path::new("/project"), None, true)
    }

    #[test]
    fn test_bare_depends_on_waits_for_start_only() {
        let svc = service("image: app\ndepends_on: [db, redis]\n").unwrap();
        assert_eq!(svc.depends_on.len(), 2);
        assert!(svc
            .depends_on
            .iter()
            .all(|d| d.condition == DependencyCondition::Started && d.required));
    }

    #[test]
    fn test_health_gated_dependency() {
        let svc = service(
            r#"
image: app
depends_on:
  db:
    condition: service_healthy
  cache:
    condition: service_started
    required: false
"#,
        )
        .unwrap();
        let db = svc.depends_on.iter().find(|d| d.service == "db").unwrap();
        let cache = svc.depends_on.iter().find(|d| d.service == "cache").unwrap();
        assert_eq!(db.condition, DependencyCondition::Healthy);
        assert_eq!(cache.condition, DependencyCondition::Started);
        assert!(!cache.required);
    }

    #[test]
    fn test_healthcheck_defaults_and_forms() {
        let svc = service(
            r#"
image: postgres
healthcheck:
  test: ["CMD-SHELL", "pg_isready -U postgres"]
  interval: 5s
"#,
        )
        .unwrap();
        let hc = svc.healthcheck.unwrap();
        assert_eq!(hc.test, Command::Shell("pg_isready -U postgres".into()));
        assert_eq!(hc.interval, Duration::from_secs(5));
        assert_eq!(hc.timeout, HealthProbe::DEFAULT_TIMEOUT);
        assert_eq!(hc.retries, 3);

        let disabled = service("image: a\nhealthcheck:\n  test: [\"NONE\"]\n").unwrap();
        assert!(disabled.healthcheck.is_none());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = service("image: a\nhealthcheck:\n  test: x\n  retries: 0\n").unwrap_err();
        assert!(matches!(err, MusterError::Manifest { .. }));
    }

    #[test]
    fn test_mount_short_syntax() {
        let svc = service(
            r#"
image: app
volumes:
  - static_volume:/app/staticfiles
  - ./backend:/app:ro
  - /var/cache
"#,
        )
        .unwrap();
        assert_eq!(
            svc.mounts[0].kind,
            MountKind::Volume {
                name: "static_volume".into()
            }
        );
        assert_eq!(
            svc.mounts[1].kind,
            MountKind::Bind {
                source: PathBuf::from("/project/./backend"),
                create_host_path: true
            }
        );
        assert!(svc.mounts[1].read_only);
        assert_eq!(svc.mounts[2].kind, MountKind::Anonymous);
    }

    #[test]
    fn test_ports() {
        let svc = service("image: a\nports:\n  - \"127.0.0.1:8000:80/udp\"\n  - 9000\n").unwrap();
        assert_eq!(svc.ports[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(svc.ports[0].published.as_deref(), Some("8000"));
        assert_eq!(svc.ports[0].target, 80);
        assert_eq!(svc.ports[0].protocol, "udp");
        assert_eq!(svc.ports[1].target, 9000);
    }

    #[test]
    fn test_build_target_override() {
        let config: ServiceConfig =
            serde_yaml::from_str("build:\n  context: ./backend\n  target: production\n").unwrap();
        let svc =
            Service::from_config("web", &config, Path::new("/p"), Some("development"), true)
                .unwrap();
        let build = svc.build().unwrap();
        assert_eq!(build.target.as_deref(), Some("development"));
        assert_eq!(build.dockerfile, PathBuf::from("/p/./backend/Dockerfile"));
    }

    #[test]
    fn test_argv_concatenates_entrypoint_and_command() {
        let svc = service("image: a\nentrypoint: [\"/entrypoint.sh\"]\ncommand: [\"runserver\"]\n")
            .unwrap();
        assert_eq!(svc.argv(), vec!["/entrypoint.sh", "runserver"]);
    }
}
