//! Workflow document schema.
//!
//! The structures mirror the YAML an author writes: a workflow owns an ordered
//! mapping of jobs, each job owns an ordered list of steps. Authoring order is
//! preserved with `IndexMap` because it is also execution order.

pub mod validation;

use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value as YamlValue;

use crate::{deserialize_string_map, scalar_to_string};

/// Top-level workflow document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    #[serde(default)]
    pub name: String,
    /// Author-controlled version string.
    #[serde(default)]
    pub version: String,
    /// Directory the process switches to before the first job runs.
    #[serde(default, rename = "working-dir")]
    pub working_dir: Option<PathBuf>,
    /// Workflow-level environment. Values may reference `${VAR}` and `${{ expr }}`.
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub env: IndexMap<String, String>,
    /// Line-oriented `KEY=VALUE` files merged underneath `env`.
    #[serde(default, rename = "env-files")]
    pub env_files: Vec<PathBuf>,
    /// Requirements verified during preflight.
    #[serde(default)]
    pub checks: ChecksDefinition,
    /// Jobs keyed by name, in execution order.
    #[serde(default)]
    pub jobs: IndexMap<String, JobDefinition>,
}

/// Declared requirements on the invocation environment.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ChecksDefinition {
    /// When true, a private key must be configured for the run.
    #[serde(default, rename = "private-key")]
    pub private_key: bool,
    /// Caller arguments that must be supplied.
    #[serde(default)]
    pub args: Vec<CheckItem>,
    /// Environment variables that must resolve in the workflow scope.
    #[serde(default)]
    pub envs: Vec<CheckItem>,
}

/// A single required name with an optional regular expression.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CheckItem {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// A job: local environment overrides and an ordered list of steps.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct JobDefinition {
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// A step as authored. Exactly one of `script`, `run` or `uses` must be set;
/// the engine enforces that when it builds the step runner.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub env: IndexMap<String, String>,
    /// Gate deciding whether the step runs at all.
    #[serde(default, rename = "if")]
    pub r#if: Option<ControlExpression>,
    /// Gate deciding whether a failure of this step is tolerated.
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: Option<ControlExpression>,
    /// Inline script source.
    #[serde(default)]
    pub script: Option<String>,
    /// Inline shell command text.
    #[serde(default)]
    pub run: Option<String>,
    /// Plugin reference (`name@version`, a local path, or a built-in name).
    #[serde(default)]
    pub uses: Option<String>,
    /// Plugin configuration.
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub with: IndexMap<String, String>,
}

impl StepDefinition {
    /// Name used in logs, errors and the status tree.
    pub fn display_name(&self) -> &str {
        if !self.name.trim().is_empty() {
            return self.name.as_str();
        }
        self.id.as_deref().filter(|id| !id.trim().is_empty()).unwrap_or("unnamed step")
    }
}

/// Value of an `if` or `continue-on-error` field.
///
/// A bare boolean (`true`, `false`, in YAML or as text) is a constant; any
/// other text is a template that must consist of exactly one `${{ expr }}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlExpression {
    Constant(bool),
    Template(String),
}

impl ControlExpression {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            ControlExpression::Constant(true)
        } else if trimmed.eq_ignore_ascii_case("false") {
            ControlExpression::Constant(false)
        } else {
            ControlExpression::Template(raw.to_string())
        }
    }
}

impl fmt::Display for ControlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlExpression::Constant(flag) => write!(f, "{flag}"),
            ControlExpression::Template(text) => f.write_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for ControlExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = YamlValue::deserialize(deserializer)?;
        if let YamlValue::Bool(flag) = value {
            return Ok(ControlExpression::Constant(flag));
        }
        let text = scalar_to_string(&value).map_err(serde::de::Error::custom)?;
        Ok(ControlExpression::parse(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
name: release
version: "1.2"
working-dir: /tmp
env:
  TARGET: ${HOME}/out
env-files:
  - base.env
checks:
  private-key: true
  args:
    - name: BRANCH
      pattern: "^release/.+$"
  envs:
    - name: TARGET
jobs:
  build:
    env:
      MODE: fast
    steps:
      - name: compile
        run: make all
        continue-on-error: true
      - name: publish
        uses: uploader@v1
        if: ${{ args.BRANCH ~= nil }}
        with:
          bucket: artifacts
          retries: 3
  notify:
    steps:
      - id: ping
        script: return 1
"#;

    #[test]
    fn workflow_document_deserializes_in_authoring_order() {
        let definition: WorkflowDefinition = serde_yaml::from_str(DOCUMENT).expect("parse workflow");
        assert_eq!(definition.name, "release");
        assert_eq!(definition.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(definition.env["TARGET"], "${HOME}/out");
        assert!(definition.checks.private_key);
        assert_eq!(definition.checks.args[0].pattern.as_deref(), Some("^release/.+$"));
        assert_eq!(definition.checks.envs[0].pattern, None);

        let job_names: Vec<&str> = definition.jobs.keys().map(String::as_str).collect();
        assert_eq!(job_names, vec!["build", "notify"]);

        let build = &definition.jobs["build"];
        assert_eq!(build.steps[0].continue_on_error, Some(ControlExpression::Constant(true)));
        assert_eq!(
            build.steps[1].r#if,
            Some(ControlExpression::Template("${{ args.BRANCH ~= nil }}".to_string()))
        );
        assert_eq!(build.steps[1].with["retries"], "3");
        assert_eq!(definition.jobs["notify"].steps[0].display_name(), "ping");
    }

    #[test]
    fn textual_boolean_is_a_constant() {
        assert_eq!(ControlExpression::parse(" TRUE "), ControlExpression::Constant(true));
        assert_eq!(ControlExpression::parse("false"), ControlExpression::Constant(false));
        assert_eq!(
            ControlExpression::parse("${{ false }}"),
            ControlExpression::Template("${{ false }}".to_string())
        );
    }
}
