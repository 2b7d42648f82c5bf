//! Build file parser
//!
//! Only the structure of a multi-stage build file matters here: where each
//! stage starts, what it is based on and which other stages it copies from.
//! Everything else is kept as opaque instruction text.

use crate::error::{MusterError, Result};
use serde::Serialize;
use std::path::Path;

/// Default build file name
pub const DEFAULT_BUILD_FILE: &str = "Dockerfile";

/// A single instruction, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Upper-cased keyword (`RUN`, `COPY`, ...)
    pub keyword: String,
    /// Everything after the keyword
    pub args: String,
    /// 1-based line the instruction starts on
    pub line: usize,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.keyword, self.args)
    }
}

/// Parsed build file
#[derive(Debug, Clone, Serialize)]
pub struct ParsedBuildFile {
    /// `ARG`s declared before the first `FROM`
    pub global_args: Vec<Instruction>,
    /// Build stages in declaration order
    pub stages: Vec<BuildStage>,
}

/// Build stage
#[derive(Debug, Clone, Serialize)]
pub struct BuildStage {
    /// Position in the file
    pub index: usize,
    /// `AS` alias
    pub name: Option<String>,
    /// `FROM` operand: an image reference or an earlier stage
    pub base: String,
    /// Stages or images named by `COPY --from=`
    pub copy_from: Vec<String>,
    /// Instructions after `FROM`
    pub instructions: Vec<Instruction>,
}

impl BuildStage {
    /// Alias, or the positional index when the stage is unnamed
    pub fn id(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.index.to_string())
    }
}

/// Parse a build file from disk
pub fn parse_build_file(path: &Path) -> Result<ParsedBuildFile> {
    let content = std::fs::read_to_string(path).map_err(|e| MusterError::BuildFileParse {
        line: 0,
        message: format!("cannot read {}: {}", path.display(), e),
    })?;
    parse_build_content(&content)
}

/// Parse build file content
pub fn parse_build_content(content: &str) -> Result<ParsedBuildFile> {
    let mut global_args = Vec::new();
    let mut stages: Vec<BuildStage> = Vec::new();
    let mut current_stage: Option<BuildStage> = None;
    let mut continued_line = String::new();
    let mut start_line = 0;

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if continued_line.is_empty() {
            start_line = line_num + 1;
        }

        if let Some(line_without_backslash) = line.strip_suffix('\\') {
            continued_line.push_str(line_without_backslash);
            continued_line.push(' ');
            continue;
        }

        let full_line = if !continued_line.is_empty() {
            let result = format!("{}{}", continued_line, line);
            continued_line.clear();
            result
        } else {
            line.to_string()
        };

        let (keyword, args) = match full_line.split_once(char::is_whitespace) {
            Some((k, a)) => (k.to_uppercase(), a.trim().to_string()),
            None => (full_line.to_uppercase(), String::new()),
        };

        match keyword.as_str() {
            "FROM" => {
                if let Some(stage) = current_stage.take() {
                    stages.push(stage);
                }
                let (base, name) = parse_from(&args, start_line)?;
                if let Some(alias) = &name {
                    let taken = stages
                        .iter()
                        .any(|s| s.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(alias)));
                    if taken {
                        return Err(MusterError::BuildFileParse {
                            line: start_line,
                            message: format!("duplicate stage name '{}'", alias),
                        });
                    }
                }
                current_stage = Some(BuildStage {
                    index: stages.len(),
                    name,
                    base,
                    copy_from: Vec::new(),
                    instructions: Vec::new(),
                });
            }
            _ => {
                let instruction = Instruction {
                    keyword,
                    args,
                    line: start_line,
                };
                match current_stage.as_mut() {
                    Some(stage) => {
                        if instruction.keyword == "COPY" {
                            if let Some(from) = copy_from(&instruction.args) {
                                stage.copy_from.push(from);
                            }
                        }
                        stage.instructions.push(instruction);
                    }
                    None if instruction.keyword == "ARG" => global_args.push(instruction),
                    None => {
                        return Err(MusterError::BuildFileParse {
                            line: start_line,
                            message: format!("{} before FROM", instruction.keyword),
                        })
                    }
                }
            }
        }
    }

    if let Some(stage) = current_stage {
        stages.push(stage);
    }

    if stages.is_empty() {
        return Err(MusterError::BuildFileParse {
            line: 0,
            message: "no FROM instruction found".to_string(),
        });
    }

    Ok(ParsedBuildFile {
        global_args,
        stages,
    })
}

/// `FROM [--platform=...] image[:tag] [AS name]`
fn parse_from(args: &str, line_num: usize) -> Result<(String, Option<String>)> {
    let parts: Vec<&str> = args
        .split_whitespace()
        .filter(|p| !p.starts_with("--"))
        .collect();

    let base = parts.first().ok_or_else(|| MusterError::BuildFileParse {
        line: line_num,
        message: "FROM requires an image".to_string(),
    })?;

    let alias = match parts.as_slice() {
        [_, kw, name] if kw.eq_ignore_ascii_case("AS") => Some(name.to_lowercase()),
        [_] => None,
        _ => {
            return Err(MusterError::BuildFileParse {
                line: line_num,
                message: format!("malformed FROM: {}", args),
            })
        }
    };

    Ok((base.to_string(), alias))
}

fn copy_from(args: &str) -> Option<String> {
    args.split_whitespace()
        .take_while(|p| p.starts_with("--"))
        .find_map(|p| p.strip_prefix("--from="))
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multistage_build() {
        let content = r#"
# syntax=docker/dockerfile:1
ARG PYTHON_VERSION=3.12
FROM python:${PYTHON_VERSION}-slim AS base
ENV PYTHONDONTWRITEBYTECODE=1
WORKDIR /app

FROM base AS builder
RUN pip install poetry && \
    poetry export -o requirements.txt

FROM base AS production
COPY --from=builder --chown=app /app/requirements.txt .
CMD ["gunicorn", "server.wsgi"]
"#;

        let parsed = parse_build_content(content).unwrap();
        assert_eq!(parsed.global_args.len(), 1);
        assert_eq!(parsed.stages.len(), 3);
        assert_eq!(parsed.stages[0].base, "python:${PYTHON_VERSION}-slim");
        assert_eq!(parsed.stages[1].base, "base");
        assert_eq!(parsed.stages[1].instructions.len(), 1);
        assert_eq!(parsed.stages[1].instructions[0].line, 9);
        assert_eq!(parsed.stages[2].copy_from, vec!["builder"]);
    }

    #[test]
    fn test_unnamed_stage_uses_index() {
        let parsed = parse_build_content("FROM alpine\nRUN true\nFROM scratch\n").unwrap();
        assert_eq!(parsed.stages[0].id(), "0");
        assert_eq!(parsed.stages[1].id(), "1");
    }

    #[test]
    fn test_platform_flag_and_case() {
        let parsed =
            parse_build_content("from --platform=linux/amd64 node:20 as Deps\n").unwrap();
        assert_eq!(parsed.stages[0].base, "node:20");
        assert_eq!(parsed.stages[0].name.as_deref(), Some("deps"));
    }

    #[test]
    fn test_errors() {
        assert!(parse_build_content("").is_err());
        assert!(parse_build_content("RUN echo hi\nFROM alpine\n").is_err());
        assert!(parse_build_content("FROM a AS x\nFROM b AS x\n").is_err());
        assert!(parse_build_content("FROM a AS\n").is_err());
    }
}
