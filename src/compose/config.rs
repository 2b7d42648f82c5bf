//! Compose file configuration types
//!
//! These mirror the on-disk YAML shape. Nothing here is validated beyond what
//! serde enforces; [`crate::manifest::Manifest`] turns a `ComposeConfig` into
//! the checked in-memory model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default)]
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
    /// Profile overlays, keyed by profile name
    #[serde(default, rename = "x-profiles", skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Environment file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    /// Exposed ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<Vec<ScalarValue>>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Stop grace period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    /// Profiles this service belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    /// Development settings (file watching)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub develop: Option<DevelopConfig>,
}

impl ServiceConfig {
    /// Apply `overlay` on top of this service. Set fields in the overlay win,
    /// environment maps are merged key by key.
    pub fn merge(&mut self, overlay: ServiceConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overlay.$field.is_some() {
                    self.$field = overlay.$field;
                })*
            };
        }

        match (self.environment.take(), overlay.environment) {
            (Some(base), Some(top)) => self.environment = Some(base.merged(top)),
            (base, top) => self.environment = top.or(base),
        }

        take!(
            image,
            build,
            command,
            entrypoint,
            env_file,
            expose,
            ports,
            volumes,
            networks,
            depends_on,
            healthcheck,
            working_dir,
            stop_grace_period,
            profiles,
            develop
        );
    }
}

/// Profile overlay (`x-profiles.<name>`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Build stage every built service targets under this profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Whether `develop.watch` rules are active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<bool>,
    /// Per-service overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

impl BuildConfig {
    /// Build context directory as written in the file
    pub fn context(&self) -> &str {
        match self {
            BuildConfig::Simple(path) => path,
            BuildConfig::Full(full) => full.context.as_deref().unwrap_or("."),
        }
    }

    /// Build file path relative to the context
    pub fn dockerfile(&self) -> Option<&str> {
        match self {
            BuildConfig::Simple(_) => None,
            BuildConfig::Full(full) => full.dockerfile.as_deref(),
        }
    }

    /// Explicit target stage
    pub fn target(&self) -> Option<&str> {
        match self {
            BuildConfig::Simple(_) => None,
            BuildConfig::Full(full) => full.target.as_deref(),
        }
    }
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Dockerfile path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, ScalarValue>>,
    /// Target stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<ScalarValue>>),
}

impl EnvironmentConfig {
    /// Flatten into key/value pairs. Keys without a value are dropped.
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        match self {
            EnvironmentConfig::Array(items) => items
                .iter()
                .filter_map(|item| item.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.to_string())))
                .collect(),
        }
    }

    fn merged(self, top: EnvironmentConfig) -> EnvironmentConfig {
        let mut map: BTreeMap<String, Option<ScalarValue>> = self
            .to_pairs()
            .into_iter()
            .map(|(k, v)| (k, Some(ScalarValue::String(v))))
            .collect();
        for (k, v) in top.to_pairs() {
            map.insert(k, Some(ScalarValue::String(v)));
        }
        EnvironmentConfig::Map(map)
    }
}

/// Env file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    /// Single file
    Single(String),
    /// Multiple files
    Multiple(Vec<String>),
}

impl EnvFileConfig {
    /// All listed files, in order
    pub fn paths(&self) -> Vec<&str> {
        match self {
            EnvFileConfig::Single(path) => vec![path.as_str()],
            EnvFileConfig::Multiple(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

/// A YAML scalar that compose accepts in places where a string is meant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Float
    Float(f64),
    /// String
    String(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `8000`
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<ScalarValue>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Bind options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<BindOptions>,
}

/// Bind mount options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindOptions {
    /// Create host path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_host_path: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to per-service options (ignored)
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

impl NetworksConfig {
    /// Network names in declaration order
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworksConfig::Array(names) => names.clone(),
            NetworksConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether the dependency must come up for this service to start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Restart this service when the dependency is restarted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Development configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevelopConfig {
    /// File watch rules
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

/// One `develop.watch` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// What to do when a matching file changes
    pub action: WatchActionConfig,
    /// Path (or glob) to watch, relative to the project directory
    pub path: String,
    /// Destination inside the service for sync actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Patterns to ignore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

/// Watch action keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchActionConfig {
    #[serde(rename = "sync")]
    Sync,
    #[serde(rename = "sync+restart")]
    SyncRestart,
    #[serde(rename = "rebuild")]
    Rebuild,
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// External network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// Internal network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_opts: Option<BTreeMap<String, String>>,
    /// External volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl VolumeConfig {
    /// Host device path for `driver_opts: {type: none, o: bind, device: ...}`
    pub fn bind_device(&self) -> Option<&str> {
        let opts = self.driver_opts.as_ref()?;
        let is_bind = opts
            .get("o")
            .map(|o| o.split(',').any(|part| part.trim() == "bind"))
            .unwrap_or(false);
        if is_bind {
            opts.get("device").map(String::as_str)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_map_accepts_scalars() {
        let yaml = r#"
environment:
  DEBUG: 1
  NAME: web
  EMPTY:
"#;
        let svc: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        let env = svc.environment.unwrap().to_pairs();
        assert_eq!(env.get("DEBUG").map(String::as_str), Some("1"));
        assert_eq!(env.get("NAME").map(String::as_str), Some("web"));
        assert!(!env.contains_key("EMPTY"));
    }

    #[test]
    fn test_merge_overlay_wins_and_env_merges() {
        let mut base: ServiceConfig = serde_yaml::from_str(
            r#"
image: app:1
command: gunicorn app
environment:
  A: "1"
  B: "2"
"#,
        )
        .unwrap();
        let overlay: ServiceConfig = serde_yaml::from_str(
            r#"
command: ["python", "manage.py", "runserver"]
environment:
  B: "3"
"#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.image.as_deref(), Some("app:1"));
        assert!(matches!(base.command, Some(CommandConfig::Exec(ref v)) if v[0] == "python"));
        let env = base.environment.unwrap().to_pairs();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "3");
    }

    #[test]
    fn test_bind_device() {
        let yaml = r#"
driver: local
driver_opts:
  type: none
  o: bind
  device: /srv/static
"#;
        let vol: VolumeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(vol.bind_device(), Some("/srv/static"));
    }

    #[test]
    fn test_watch_action_keywords() {
        let yaml = r#"
watch:
  - action: sync+restart
    path: ./config
    target: /app/config
  - action: rebuild
    path: poetry.lock
"#;
        let dev: DevelopConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(dev.watch[0].action, WatchActionConfig::SyncRestart);
        assert_eq!(dev.watch[1].action, WatchActionConfig::Rebuild);
    }
}
