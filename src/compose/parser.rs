//! Compose file parser

use super::config::{
    BuildConfig, ComposeConfig, DependsOnConfig, HealthcheckTest, WatchActionConfig,
};
use super::interpolate::{interpolate_value, EnvSource};
use crate::error::{MusterError, Result};
use crate::manifest::duration::parse_duration;
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path, env: &EnvSource) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MusterError::manifest(path.display().to_string(), format!("failed to read file: {}", e))
        })?;

        Self::parse_str(&content, env).map_err(|e| match e {
            MusterError::Yaml(err) => {
                MusterError::manifest(path.display().to_string(), err.to_string())
            }
            other => other,
        })
    }

    /// Parse compose content, substituting variables from `env` first
    pub fn parse_str(content: &str, env: &EnvSource) -> Result<ComposeConfig> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(ComposeConfig::default());
        }
        interpolate_value(&mut value, env, "")?;
        Ok(serde_yaml::from_value(value)?)
    }

    /// Parse multiple compose files (later files override earlier ones)
    pub fn parse_files(paths: &[PathBuf], env: &EnvSource) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            tracing::debug!("Loading compose file {}", path.display());
            let file_config = Self::parse_file(path, env)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => existing.merge(service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        result.networks.extend(overlay.networks);
        result.volumes.extend(overlay.volumes);

        for (name, profile) in overlay.profiles {
            match result.profiles.get_mut(&name) {
                Some(existing) => {
                    if profile.target.is_some() {
                        existing.target = profile.target;
                    }
                    if profile.watch.is_some() {
                        existing.watch = profile.watch;
                    }
                    for (svc, overrides) in profile.services {
                        existing.services.entry(svc).or_default().merge(overrides);
                    }
                }
                None => {
                    result.profiles.insert(name, profile);
                }
            }
        }

        result
    }

    /// Validate compose configuration.
    ///
    /// Returns non-fatal warnings; the first policy violation is an error.
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for (name, service) in &config.services {
            let context = format!("services.{}", name);

            if service.image.is_none() && service.build.is_none() {
                return Err(MusterError::manifest(
                    context,
                    "service must have either 'image' or 'build' specified",
                ));
            }

            if let Some(depends) = &service.depends_on {
                let deps: Vec<&String> = match depends {
                    DependsOnConfig::Array(arr) => arr.iter().collect(),
                    DependsOnConfig::Map(map) => map.keys().collect(),
                };
                for dep in deps {
                    if dep == name {
                        return Err(MusterError::manifest(
                            context,
                            "service cannot depend on itself",
                        ));
                    }
                    if !config.services.contains_key(dep) {
                        return Err(MusterError::manifest(
                            context,
                            format!("depends on unknown service '{}'", dep),
                        ));
                    }
                }
                if let DependsOnConfig::Map(map) = depends {
                    for (dep, cond) in map {
                        if let Some(condition) = &cond.condition {
                            if !matches!(
                                condition.as_str(),
                                "service_started" | "service_healthy"
                            ) {
                                return Err(MusterError::manifest(
                                    format!("{}.depends_on.{}", context, dep),
                                    format!("unsupported condition '{}'", condition),
                                ));
                            }
                        }
                    }
                }
            }

            if let Some(hc) = &service.healthcheck {
                let hc_context = format!("{}.healthcheck", context);
                if hc.retries == Some(0) {
                    return Err(MusterError::manifest(hc_context, "retries must be at least 1"));
                }
                for value in [&hc.interval, &hc.timeout, &hc.start_period].into_iter().flatten() {
                    parse_duration(value).map_err(|msg| MusterError::manifest(&hc_context, msg))?;
                }
                if let Some(HealthcheckTest::Array(parts)) = &hc.test {
                    match parts.first().map(String::as_str) {
                        Some("NONE") | Some("CMD") | Some("CMD-SHELL") => {}
                        _ => {
                            return Err(MusterError::manifest(
                                hc_context,
                                "test must start with CMD, CMD-SHELL or NONE",
                            ))
                        }
                    }
                }
            }

            if let Some(grace) = &service.stop_grace_period {
                parse_duration(grace).map_err(|msg| {
                    MusterError::manifest(format!("{}.stop_grace_period", context), msg)
                })?;
            }

            if let Some(develop) = &service.develop {
                for (i, rule) in develop.watch.iter().enumerate() {
                    let rule_context = format!("{}.develop.watch[{}]", context, i);
                    match rule.action {
                        WatchActionConfig::Sync | WatchActionConfig::SyncRestart => {
                            if rule.target.is_none() {
                                return Err(MusterError::manifest(
                                    rule_context,
                                    "sync actions require a 'target'",
                                ));
                            }
                        }
                        WatchActionConfig::Rebuild => {
                            if service.build.is_none() {
                                return Err(MusterError::manifest(
                                    rule_context,
                                    "rebuild requires the service to have 'build'",
                                ));
                            }
                        }
                    }
                }
            }

            if let Some(BuildConfig::Full(full)) = &service.build {
                if full.target.as_deref() == Some("") {
                    warnings.push(format!("{}: empty build target ignored", context));
                }
            }

            if let Some(networks) = &service.networks {
                for net in networks.names() {
                    if net != "default" && !config.networks.contains_key(&net) {
                        warnings.push(format!(
                            "{}: references undefined network '{}'",
                            context, net
                        ));
                    }
                }
            }
        }

        for (profile, overlay) in &config.profiles {
            for svc in overlay.services.keys() {
                if !config.services.contains_key(svc) {
                    return Err(MusterError::manifest(
                        format!("x-profiles.{}", profile),
                        format!("overrides unknown service '{}'", svc),
                    ));
                }
            }
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ComposeConfig {
        ComposeParser::parse_str(yaml, &EnvSource::new()).unwrap()
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
services:
  web:
    build:
      context: .
      target: production
    ports:
      - "8000:8000"
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres:16
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
      interval: 5s
      timeout: 5s
      retries: 5
"#;

        let config = parse(yaml);
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("web"));
        assert!(ComposeParser::validate(&config).unwrap().is_empty());
    }

    #[test]
    fn test_substitution_happens_at_parse_time() {
        let env = EnvSource::new().set("POSTGRES_PASSWORD", "s3cret");
        let config = ComposeParser::parse_str(
            r#"
services:
  db:
    image: postgres
    environment:
      POSTGRES_PASSWORD: ${POSTGRES_PASSWORD}
"#,
            &env,
        )
        .unwrap();
        let pairs = config.services["db"].environment.as_ref().unwrap().to_pairs();
        assert_eq!(pairs["POSTGRES_PASSWORD"], "s3cret");
    }

    #[test]
    fn test_unresolved_variable_is_manifest_error() {
        let result = ComposeParser::parse_str(
            "services:\n  db:\n    image: postgres:${PG_VERSION}\n",
            &EnvSource::new(),
        );
        assert!(matches!(result, Err(MusterError::Manifest { .. })));
    }

    #[test]
    fn test_validate_missing_image() {
        let config = parse("services:\n  web:\n    ports:\n      - \"80:80\"\n");
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let config = parse("services:\n  web:\n    image: a\n    depends_on: [db]\n");
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown service 'db'"));
    }

    #[test]
    fn test_validate_zero_retries() {
        let config = parse(
            r#"
services:
  db:
    image: postgres
    healthcheck:
      test: pg_isready
      retries: 0
"#,
        );
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("retries must be at least 1"));
    }

    #[test]
    fn test_validate_sync_without_target() {
        let config = parse(
            r#"
services:
  web:
    build: .
    develop:
      watch:
        - action: sync
          path: ./src
"#,
        );
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_merge_override_file() {
        let base = parse(
            r#"
services:
  web:
    build: .
    command: gunicorn server.wsgi
volumes:
  data:
"#,
        );
        let overlay = parse(
            r#"
services:
  web:
    command: python manage.py runserver
  worker:
    image: app
"#,
        );
        let merged = ComposeParser::merge_configs(base, overlay);
        assert_eq!(merged.services.len(), 2);
        assert!(merged.volumes.contains_key("data"));
        assert!(merged.services["web"].build.is_some());
        assert!(matches!(
            merged.services["web"].command,
            Some(super::super::config::CommandConfig::Shell(ref s)) if s.starts_with("python")
        ));
    }

    #[test]
    fn test_find_compose_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(temp.path()).is_none());
        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let found = ComposeParser::find_compose_file(temp.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }
}
