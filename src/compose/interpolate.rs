//! Variable substitution for compose files
//!
//! Substitution runs once, over every string scalar of the parsed YAML tree,
//! before the tree is turned into typed configuration. Values produced by a
//! substitution are never re-scanned.

use crate::error::{MusterError, Result};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Key/value source used to resolve `${VAR}` references
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Set a variable, replacing any previous value
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Layer `other` underneath this source: keys already present here win.
    pub fn with_fallback(mut self, other: EnvSource) -> Self {
        for (key, value) in other.vars {
            self.vars.entry(key).or_insert(value);
        }
        self
    }

    /// Load a dotenv-style file. A missing file yields an empty source.
    pub fn from_dotenv(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Ok(Self {
            vars: read_dotenv(path)?,
        })
    }
}

/// Read `KEY=value` pairs from a dotenv file without touching the process
/// environment.
pub fn read_dotenv(path: &Path) -> Result<BTreeMap<String, String>> {
    let invalid =
        |e: dotenv::Error| MusterError::manifest(path.display().to_string(), e.to_string());
    dotenv::from_path_iter(path)
        .map_err(invalid)?
        .map(|item| item.map_err(invalid))
        .collect()
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"\$(?:(?P<escape>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?[-?])(?P<arg>[^}]*))?\}|(?P<bare>[A-Za-z_][A-Za-z0-9_]*))",
        )
        .expect("interpolation pattern is valid")
    })
}

/// Substitute variables in a single string. `context` names the location for
/// error messages.
pub fn interpolate_str(input: &str, env: &EnvSource, context: &str) -> Result<String> {
    let mut failure: Option<MusterError> = None;

    let output = pattern().replace_all(input, |caps: &Captures| {
        if caps.name("escape").is_some() {
            return "$".to_string();
        }

        let name = caps
            .name("braced")
            .or_else(|| caps.name("bare"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let value = env.get(name);
        let op = caps.name("op").map(|m| m.as_str());
        let arg = caps.name("arg").map(|m| m.as_str()).unwrap_or_default();

        let resolved = match op {
            Some(":-") => Some(value.filter(|v| !v.is_empty()).unwrap_or(arg).to_string()),
            Some("-") => Some(value.unwrap_or(arg).to_string()),
            Some(":?") => value.filter(|v| !v.is_empty()).map(str::to_string),
            _ => value.map(str::to_string),
        };

        match resolved {
            Some(v) => v,
            None => {
                if failure.is_none() {
                    let reason = if matches!(op, Some(":?") | Some("?")) && !arg.is_empty() {
                        arg.to_string()
                    } else {
                        "required variable is not set".to_string()
                    };
                    failure = Some(MusterError::manifest(
                        context,
                        format!("${{{}}}: {}", name, reason),
                    ));
                }
                String::new()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(output.into_owned()),
    }
}

/// Substitute variables in every string scalar of a YAML tree, in place.
pub fn interpolate_value(value: &mut Value, env: &EnvSource, path: &str) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = interpolate_str(s, env, path)?;
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                interpolate_value(item, env, &format!("{}[{}]", path, i))?;
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let key = key.as_str().unwrap_or("?");
                let child = if path.is_empty() {
                    key.to_string()
                } else {
                    format!("{}.{}", path, key)
                };
                interpolate_value(item, env, &child)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env, path)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvSource {
        EnvSource::new()
            .set("TAG", "1.0.0")
            .set("EMPTY", "")
            .set("DB_USER", "postgres")
    }

    #[test]
    fn test_braced_and_bare() {
        assert_eq!(interpolate_str("nginx:${TAG}", &env(), "t").unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate_str("u=$DB_USER!", &env(), "t").unwrap(), "u=postgres!");
    }

    #[test]
    fn test_defaults() {
        let e = env();
        assert_eq!(interpolate_str("${MISSING:-x}", &e, "t").unwrap(), "x");
        assert_eq!(interpolate_str("${EMPTY:-x}", &e, "t").unwrap(), "x");
        assert_eq!(interpolate_str("${EMPTY-x}", &e, "t").unwrap(), "");
        assert_eq!(interpolate_str("${MISSING-x}", &e, "t").unwrap(), "x");
    }

    #[test]
    fn test_escape_is_not_rescanned() {
        assert_eq!(interpolate_str("$${TAG}", &env(), "t").unwrap(), "${TAG}");
    }

    #[test]
    fn test_substituted_value_is_not_rescanned() {
        let e = EnvSource::new().set("A", "$B").set("B", "nope");
        assert_eq!(interpolate_str("${A}", &e, "t").unwrap(), "$B");
    }

    #[test]
    fn test_unset_required_variable_is_an_error() {
        let err = interpolate_str("${DB_PASSWORD}", &env(), "services.db.environment")
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DB_PASSWORD"), "{msg}");
        assert!(msg.contains("services.db.environment"), "{msg}");
    }

    #[test]
    fn test_question_mark_message() {
        let err = interpolate_str("${SECRET:?set a secret}", &env(), "t").unwrap_err();
        assert!(err.to_string().contains("set a secret"));
        let err = interpolate_str("${EMPTY:?must be non-empty}", &env(), "t").unwrap_err();
        assert!(err.to_string().contains("must be non-empty"));
        assert_eq!(interpolate_str("${EMPTY?unset}", &env(), "t").unwrap(), "");
    }

    #[test]
    fn test_value_tree_paths() {
        let mut value: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: "app:${TAG}"
    command: ["echo", "${NOPE}"]
"#,
        )
        .unwrap();
        let err = interpolate_value(&mut value, &env(), "").unwrap_err();
        assert!(err.to_string().contains("services.web.command[1]"), "{err}");
    }

    #[test]
    fn test_read_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# comment\nexport A=1 # note\nMUSTER_QUOTED=\"say \\\"hi\\\"\"\nC='x y'\n\n",
        )
        .unwrap();

        let vars = read_dotenv(&path).unwrap();
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["MUSTER_QUOTED"], "say \"hi\"");
        assert_eq!(vars["C"], "x y");
        assert_eq!(vars.len(), 3);
        assert!(std::env::var("MUSTER_QUOTED").is_err());
    }

    #[test]
    fn test_missing_dotenv_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = EnvSource::from_dotenv(&dir.path().join(".env")).unwrap();
        assert_eq!(source.get("A"), None);
    }

    #[test]
    fn test_fallback_layering() {
        let process = EnvSource::new().set("A", "process");
        let dotenv = EnvSource::new().set("A", "file").set("B", "file");
        let merged = process.with_fallback(dotenv);
        assert_eq!(merged.get("A"), Some("process"));
        assert_eq!(merged.get("B"), Some("file"));
    }
}
