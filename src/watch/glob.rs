//! Path matching for watch rules
//!
//! Rule paths are relative to the project directory. A plain path matches
//! itself and everything beneath it. A path with `*`, `?` or `[` is a glob,
//! where `**` spans directories. Ignore patterns without a `/` match any
//! single path component; patterns with a `/` match the path relative to the
//! rule root.

use crate::error::{MusterError, Result};
use regex::Regex;
use std::path::{Component, Path, PathBuf};

/// Whether `pattern` contains glob metacharacters
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(|c: char| matches!(c, '*' | '?' | '['))
}

/// Compile a glob into an anchored regex
pub fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i + 1)
                    .ok_or_else(|| {
                        MusterError::manifest(
                            "develop.watch",
                            format!("unclosed '[' in '{}'", pattern),
                        )
                    })?;
                re.push('[');
                let mut class = &chars[i + 1..close];
                if class.first() == Some(&'!') {
                    re.push('^');
                    class = &class[1..];
                }
                for c in class {
                    if *c == '\\' || *c == '[' {
                        re.push('\\');
                    }
                    re.push(*c);
                }
                re.push(']');
                i = close;
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    re.push('$');
    Regex::new(&re).map_err(|e| MusterError::manifest("develop.watch", e.to_string()))
}

/// Lexically normalize a relative path: drop `.` and leading `./`, fold `..`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

#[derive(Debug, Clone)]
enum Ignore {
    /// Matches any single component
    Component(Regex),
    /// Matches the path relative to the rule root, or one of its ancestors
    Relative(Regex),
}

/// Compiled rule path and ignore set
#[derive(Debug, Clone)]
pub struct PathMatcher {
    project_dir: PathBuf,
    /// Normalized rule path relative to the project
    rule: String,
    /// Glob form of the rule, when it is one
    glob: Option<Regex>,
    ignore: Vec<Ignore>,
}

impl PathMatcher {
    /// Compile a rule path and its ignore patterns
    pub fn new(project_dir: &Path, path: &str, ignore: &[String]) -> Result<Self> {
        let rule = match Path::new(path).strip_prefix(project_dir) {
            Ok(rel) => normalize(&rel.to_string_lossy()),
            Err(_) => normalize(path),
        };
        let glob = if is_glob(&rule) {
            Some(compile_glob(&rule)?)
        } else {
            None
        };
        let ignore = ignore
            .iter()
            .map(|p| {
                let p = normalize(p);
                if p.contains('/') {
                    compile_glob(&p).map(Ignore::Relative)
                } else {
                    compile_glob(&p).map(Ignore::Component)
                }
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            rule,
            glob,
            ignore,
        })
    }

    /// Directory or file to watch: the rule path up to its first glob segment
    pub fn root(&self) -> PathBuf {
        let fixed: Vec<&str> = self
            .rule
            .split('/')
            .take_while(|segment| !is_glob(segment))
            .filter(|s| !s.is_empty())
            .collect();
        self.project_dir.join(fixed.join("/"))
    }

    /// Path of `path` relative to the project, `/`-separated
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.project_dir).ok()?
        } else {
            path
        };
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Some(normalize(&parts.join("/")))
    }

    /// Part of `rel` beneath the rule root
    fn beneath(&self, rel: &str) -> Option<String> {
        let root = self
            .root()
            .strip_prefix(&self.project_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if root.is_empty() {
            return Some(rel.to_string());
        }
        if rel == root {
            return Some(String::new());
        }
        rel.strip_prefix(&format!("{}/", root)).map(str::to_string)
    }

    /// Whether a change to `path` should trigger the rule
    pub fn matches(&self, path: &Path) -> bool {
        let Some(rel) = self.relative(path) else {
            return false;
        };

        let hit = match &self.glob {
            Some(glob) => ancestors(&rel).any(|p| glob.is_match(p)),
            None => {
                self.rule.is_empty()
                    || rel == self.rule
                    || rel.starts_with(&format!("{}/", self.rule))
            }
        };

        hit && !self.is_ignored(&rel)
    }

    fn is_ignored(&self, rel: &str) -> bool {
        let Some(beneath) = self.beneath(rel) else {
            return false;
        };
        self.ignore.iter().any(|ignore| match ignore {
            Ignore::Component(re) => beneath.split('/').any(|c| re.is_match(c)),
            Ignore::Relative(re) => ancestors(&beneath).any(|p| re.is_match(p)),
        })
    }

    /// Destination of `path` inside the service for a rule syncing to
    /// `target`: the rule root maps onto `target`.
    pub fn target_for(&self, path: &Path, target: &str) -> Option<String> {
        let rel = self.relative(path)?;
        let beneath = self.beneath(&rel)?;
        let target = target.trim_end_matches('/');
        if beneath.is_empty() {
            Some(target.to_string())
        } else {
            Some(format!("{}/{}", target, beneath))
        }
    }
}

/// `a/b/c`, `a/b`, `a`
fn ancestors(rel: &str) -> impl Iterator<Item = &str> {
    let mut end = Some(rel.len());
    std::iter::from_fn(move || {
        let current = end?;
        let slice = &rel[..current];
        end = slice.rfind('/');
        Some(slice)
    })
    .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_glob() {
        let re = compile_glob("src/**/*.rs").unwrap();
        assert!(re.is_match("src/main.rs"));
        assert!(re.is_match("src/a/b/lib.rs"));
        assert!(!re.is_match("src/main.py"));

        let re = compile_glob("*.py[co]").unwrap();
        assert!(re.is_match("x.pyc"));
        assert!(!re.is_match("dir/x.pyc"));

        let re = compile_glob("file?.[!a]").unwrap();
        assert!(re.is_match("file1.b"));
        assert!(!re.is_match("file1.a"));
        assert!(compile_glob("bad[").is_err());
    }

    #[test]
    fn test_plain_path_matches_itself_and_below() {
        let m = PathMatcher::new(Path::new("/p"), "./backend", &[]).unwrap();
        assert!(m.matches(Path::new("/p/backend")));
        assert!(m.matches(Path::new("/p/backend/app/views.py")));
        assert!(!m.matches(Path::new("/p/backend2/x")));
        assert!(!m.matches(Path::new("/elsewhere/backend/x")));
        assert_eq!(m.root(), PathBuf::from("/p/backend"));
    }

    #[test]
    fn test_ignore_component_patterns() {
        let ignore = vec!["*.pyc".to_string(), "__pycache__".to_string()];
        let m = PathMatcher::new(Path::new("/p"), "./backend", &ignore).unwrap();
        assert!(!m.matches(Path::new("/p/backend/app/views.pyc")));
        assert!(!m.matches(Path::new("/p/backend/__pycache__/views.cpython-312.py")));
        assert!(m.matches(Path::new("/p/backend/app/views.py")));
    }

    #[test]
    fn test_ignore_relative_patterns() {
        let ignore = vec!["static/build/".to_string()];
        let m = PathMatcher::new(Path::new("/p"), "frontend", &ignore).unwrap();
        assert!(!m.matches(Path::new("/p/frontend/static/build/app.js")));
        assert!(m.matches(Path::new("/p/frontend/static/app.js")));
    }

    #[test]
    fn test_glob_rule() {
        let m = PathMatcher::new(Path::new("/p"), "backend/**/*.toml", &[]).unwrap();
        assert_eq!(m.root(), PathBuf::from("/p/backend"));
        assert!(m.matches(Path::new("/p/backend/pyproject.toml")));
        assert!(m.matches(Path::new("backend/conf/app.toml")));
        assert!(!m.matches(Path::new("/p/backend/app.py")));
    }

    #[test]
    fn test_target_for() {
        let m = PathMatcher::new(Path::new("/p"), "./backend", &[]).unwrap();
        assert_eq!(
            m.target_for(Path::new("/p/backend/app/views.py"), "/app/").as_deref(),
            Some("/app/app/views.py")
        );
        assert_eq!(m.target_for(Path::new("/p/backend"), "/app").as_deref(), Some("/app"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./a/./b/../c/"), "a/c");
        assert_eq!(normalize("."), "");
    }
}
