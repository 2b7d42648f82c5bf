//! Run settings
//!
//! Everything a command needs that does not come from the manifest itself:
//! where the project lives, which files make it up, what it is called and
//! where run state goes. Command-line flags win over environment variables,
//! which win over the manifest and defaults.

use crate::compose::{ComposeParser, EnvSource};
use crate::error::{MusterError, Result};
use crate::manifest::normalize_project_name;
use crate::watch::DEFAULT_DEBOUNCE;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Project-local state directory name
pub const STATE_DIR_NAME: &str = ".muster";

/// Default time allowed for teardown after an interrupt
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--project-name`
    pub project_name: Option<String>,
    /// `--project-directory`
    pub project_directory: Option<PathBuf>,
    /// `-f/--file`, in order
    pub files: Vec<PathBuf>,
    /// `--env-file`, in order
    pub env_files: Vec<PathBuf>,
}

/// Resolved settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    /// Project directory; relative manifest paths resolve against it
    pub project_dir: PathBuf,
    /// Manifest files, base first
    pub files: Vec<PathBuf>,
    /// Env files feeding variable substitution
    pub env_files: Vec<PathBuf>,
    /// Whether `env_files` came from `--env-file` rather than the default
    pub env_files_explicit: bool,
    /// Project name from flags or environment, before the manifest is read
    pub project_name: Option<String>,
    /// Where run state, volumes and service roots live
    pub state_dir: PathBuf,
    /// Quiet period before a watch action fires
    pub debounce: Duration,
    /// Grace period for services without their own `stop_grace_period`
    pub stop_grace: Duration,
    /// Time allowed for teardown after an interrupt
    pub shutdown_grace: Duration,
}

impl Settings {
    /// Resolve settings from flags and the process environment
    pub fn resolve(overrides: &Overrides, cwd: &Path) -> Result<Self> {
        Self::resolve_with(overrides, cwd, &EnvSource::from_process())
    }

    /// Resolve settings from flags and `env`
    pub fn resolve_with(overrides: &Overrides, cwd: &Path, env: &EnvSource) -> Result<Self> {
        let files: Vec<PathBuf> = overrides.files.iter().map(|f| absolute(cwd, f)).collect();

        let project_dir = match (&overrides.project_directory, files.first()) {
            (Some(dir), _) => absolute(cwd, dir),
            (None, Some(first)) => first
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cwd.to_path_buf()),
            (None, None) => cwd.to_path_buf(),
        };

        let files = if files.is_empty() {
            let found = ComposeParser::find_compose_file(&project_dir).ok_or_else(|| {
                MusterError::manifest(
                    project_dir.display().to_string(),
                    "no compose file found (compose.yaml, compose.yml, docker-compose.yaml, docker-compose.yml)",
                )
            })?;
            vec![found]
        } else {
            files
        };

        let env_files = if overrides.env_files.is_empty() {
            vec![project_dir.join(".env")]
        } else {
            overrides
                .env_files
                .iter()
                .map(|f| absolute(cwd, f))
                .collect()
        };

        let project_name = overrides
            .project_name
            .clone()
            .or_else(|| env.get("MUSTER_PROJECT_NAME").map(str::to_string))
            .or_else(|| env.get("COMPOSE_PROJECT_NAME").map(str::to_string))
            .filter(|name| !name.is_empty());

        let state_dir = match env.get("MUSTER_STATE_DIR") {
            Some(dir) if !dir.is_empty() => absolute(cwd, Path::new(dir)),
            _ => default_state_dir(&project_dir),
        };

        let debounce = env
            .get("MUSTER_DEBOUNCE_MS")
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DEBOUNCE);

        let shutdown_grace = env
            .get("MUSTER_SHUTDOWN_GRACE")
            .and_then(|s| crate::manifest::duration::parse_duration(s).ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE);

        Ok(Self {
            project_dir,
            files,
            env_files,
            env_files_explicit: !overrides.env_files.is_empty(),
            project_name,
            state_dir,
            debounce,
            stop_grace: crate::manifest::DEFAULT_STOP_GRACE,
            shutdown_grace,
        })
    }

    /// Substitution source: process environment over the env files, later
    /// env files over earlier ones. An explicit env file must exist.
    pub fn env_source(&self, process: EnvSource) -> Result<EnvSource> {
        let mut files = EnvSource::new();
        for path in &self.env_files {
            if self.env_files_explicit && !path.is_file() {
                return Err(MusterError::manifest(
                    "env_file",
                    format!("{} does not exist", path.display()),
                ));
            }
            files = EnvSource::from_dotenv(path)?.with_fallback(files);
        }
        Ok(process.with_fallback(files))
    }

    /// Final project name: flags and environment, then the manifest's
    /// `name`, then the project directory's name.
    pub fn project_name(&self, manifest_name: Option<&str>) -> String {
        let raw = self
            .project_name
            .clone()
            .or_else(|| manifest_name.map(str::to_string))
            .or_else(|| {
                self.project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        normalize_project_name(&raw)
    }

    /// Directory of managed volumes
    pub fn volumes_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }

    /// Root of per-service directories
    pub fn rootfs_dir(&self) -> PathBuf {
        self.state_dir.join("rootfs")
    }

    /// Service output of detached runs
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// `<project>/.muster`, or a per-project directory under the user data
/// directory when the project directory is read only.
fn default_state_dir(project_dir: &Path) -> PathBuf {
    let writable = std::fs::metadata(project_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(true);
    if writable {
        return project_dir.join(STATE_DIR_NAME);
    }

    let name = project_dir
        .file_name()
        .map(|n| normalize_project_name(&n.to_string_lossy()))
        .unwrap_or_else(|| "default".to_string());
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("muster")
        .join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let dir = project();
        let settings =
            Settings::resolve_with(&Overrides::default(), dir.path(), &EnvSource::new()).unwrap();
        assert_eq!(settings.project_dir, dir.path());
        assert_eq!(settings.files, vec![dir.path().join("compose.yaml")]);
        assert_eq!(settings.state_dir, dir.path().join(".muster"));
        assert_eq!(settings.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(settings.stop_grace, Duration::from_secs(10));
        assert_eq!(settings.project_name(Some("Shop")), "shop");
    }

    #[test]
    fn test_missing_compose_file() {
        let dir = TempDir::new().unwrap();
        let err = Settings::resolve_with(&Overrides::default(), dir.path(), &EnvSource::new())
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_project_name_precedence() {
        let dir = project();
        let env = EnvSource::new()
            .set("COMPOSE_PROJECT_NAME", "fromcompose")
            .set("MUSTER_PROJECT_NAME", "frommuster");
        let settings = Settings::resolve_with(&Overrides::default(), dir.path(), &env).unwrap();
        assert_eq!(settings.project_name(Some("manifest")), "frommuster");

        let overrides = Overrides {
            project_name: Some("Flag_Name".into()),
            ..Default::default()
        };
        let settings = Settings::resolve_with(&overrides, dir.path(), &env).unwrap();
        assert_eq!(settings.project_name(Some("manifest")), "flag_name");

        let settings =
            Settings::resolve_with(&Overrides::default(), dir.path(), &EnvSource::new()).unwrap();
        assert_eq!(settings.project_name(Some("manifest")), "manifest");
    }

    #[test]
    fn test_file_flag_sets_project_directory() {
        let dir = project();
        let sub = dir.path().join("deploy");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("stack.yaml"), "services: {}\n").unwrap();

        let overrides = Overrides {
            files: vec![PathBuf::from("deploy/stack.yaml")],
            ..Default::default()
        };
        let settings = Settings::resolve_with(&overrides, dir.path(), &EnvSource::new()).unwrap();
        assert_eq!(settings.project_dir, sub);
        assert_eq!(settings.files, vec![sub.join("stack.yaml")]);
    }

    #[test]
    fn test_env_source_layers() {
        let dir = project();
        std::fs::write(dir.path().join(".env"), "TAG=from-dotenv\nPORT=8000\n").unwrap();
        let settings =
            Settings::resolve_with(&Overrides::default(), dir.path(), &EnvSource::new()).unwrap();

        let env = settings
            .env_source(EnvSource::new().set("TAG", "from-process"))
            .unwrap();
        assert_eq!(env.get("TAG"), Some("from-process"));
        assert_eq!(env.get("PORT"), Some("8000"));
    }

    #[test]
    fn test_explicit_env_files() {
        let dir = project();
        std::fs::write(dir.path().join("a.env"), "A=1\nB=1\n").unwrap();
        std::fs::write(dir.path().join("b.env"), "B=2\n").unwrap();
        let overrides = Overrides {
            env_files: vec!["a.env".into(), "b.env".into()],
            ..Default::default()
        };
        let settings = Settings::resolve_with(&overrides, dir.path(), &EnvSource::new()).unwrap();
        let env = settings.env_source(EnvSource::new()).unwrap();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some("2"));

        let overrides = Overrides {
            env_files: vec!["missing.env".into()],
            ..Default::default()
        };
        let settings = Settings::resolve_with(&overrides, dir.path(), &EnvSource::new()).unwrap();
        assert!(settings.env_source(EnvSource::new()).is_err());
    }

    #[test]
    fn test_explicit_dotenv_named_file_must_exist() {
        let dir = project();
        let overrides = Overrides {
            env_files: vec!["sub/.env".into()],
            ..Default::default()
        };
        let settings = Settings::resolve_with(&overrides, dir.path(), &EnvSource::new()).unwrap();
        let err = settings.env_source(EnvSource::new()).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{err}");

        let settings =
            Settings::resolve_with(&Overrides::default(), dir.path(), &EnvSource::new()).unwrap();
        assert!(!settings.env_files_explicit);
        assert!(settings.env_source(EnvSource::new()).is_ok());
    }
}
