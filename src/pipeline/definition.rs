// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Pipeline definition structures
//!
//! Defines the schema of pipeline definition YAML files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use super::duration;
use crate::condition::Condition;
use crate::errors::JobflowError;
use crate::trigger::Triggers;

/// Pipeline definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline (workflow) name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Events that start a run
    #[serde(default, rename = "on")]
    pub triggers: Triggers,

    /// Concurrency group settings
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,

    /// Branch patterns whose runs are never cancelled by newer runs
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,

    /// Global environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Declared variables, addressable as `vars.NAME` in conditions
    #[serde(default)]
    pub vars: HashMap<String, String>,

    /// Environment variable names whose values are masked in captured output
    #[serde(default)]
    pub mask_env: Vec<String>,

    /// Jobs forming the dependency graph
    pub jobs: Vec<Job>,
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_string()]
}

impl PipelineDefinition {
    /// Load a definition from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, JobflowError> {
        if !path.exists() {
            return Err(JobflowError::DefinitionNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| JobflowError::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_yaml(&content)
    }

    /// Parse a definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, JobflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize the definition to YAML
    pub fn to_yaml(&self) -> Result<String, JobflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get a job by name
    pub fn get_job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Get all job names
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }
}

/// Concurrency group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Group key template, e.g. `${{ workflow }}-${{ ref }}`
    #[serde(default)]
    pub group: Option<String>,

    /// Cancel a non-terminal run when a newer run joins the group
    #[serde(default = "default_true")]
    pub cancel_in_progress: bool,
}

fn default_true() -> bool {
    true
}

/// A job: dependency edges plus sequential steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job name (must be unique within the definition)
    pub name: String,

    /// Job description
    #[serde(default)]
    pub description: Option<String>,

    /// Jobs that must reach a terminal state first
    #[serde(default)]
    pub needs: Vec<String>,

    /// Condition for running this job
    #[serde(default, rename = "if")]
    pub condition: Option<Condition>,

    /// A failure of this job does not skip its dependents or fail the run
    #[serde(default)]
    pub continue_on_error: bool,

    /// Deadline for the whole job
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,

    /// Environment variables for every step of this job
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Steps, executed strictly in order
    pub steps: Vec<Step>,
}

impl Job {
    /// Whether any step of this job invokes the given action
    pub fn uses_action(&self, action: &str) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(&s.action, StepAction::Uses { action: a, .. } if a == action))
    }
}

/// A single step of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct Step {
    pub name: Option<String>,
    pub action: StepAction,
    pub condition: Option<Condition>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub env: HashMap<String, String>,
    pub continue_on_error: bool,
}

/// What a step executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell command
    Run { command: String, shell: String },
    /// Named action with parameters
    Uses {
        action: String,
        with: BTreeMap<String, String>,
    },
}

impl Step {
    /// Create a shell step with default settings
    pub fn run(command: impl Into<String>) -> Self {
        Self::new(StepAction::Run {
            command: command.into(),
            shell: default_shell(),
        })
    }

    /// Create an action step with default settings
    pub fn uses(action: impl Into<String>, with: BTreeMap<String, String>) -> Self {
        Self::new(StepAction::Uses {
            action: action.into(),
            with,
        })
    }

    fn new(action: StepAction) -> Self {
        Self {
            name: None,
            action,
            condition: None,
            timeout: None,
            retry: RetryPolicy::default(),
            env: HashMap::new(),
            continue_on_error: false,
        }
    }

    /// Name used in logs and reports
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        match &self.action {
            StepAction::Uses { action, .. } => action.clone(),
            StepAction::Run { command, .. } => {
                let first_line = command.lines().next().unwrap_or_default().trim();
                if first_line.chars().count() > 40 {
                    let truncated: String = first_line.chars().take(37).collect();
                    format!("{}...", truncated)
                } else {
                    first_line.to_string()
                }
            }
        }
    }
}

/// Retry behaviour of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait between attempts
    #[serde(default, with = "duration::option")]
    pub delay: Option<Duration>,

    /// Whether a timed-out attempt may be retried
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,

    /// Exit codes that are never retried
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: None,
            retry_on_timeout: true,
            fatal_exit_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` attempts with an optional delay
    pub fn attempts(max_attempts: u32, delay: Option<Duration>) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Action parameter as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<ParamValue> for String {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Str(s) => s,
        }
    }
}

/// Wire form of [`Step`]; exactly one of `run` and `uses` must be set
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    shell: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    uses: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    with: BTreeMap<String, ParamValue>,

    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    condition: Option<Condition>,

    #[serde(
        default,
        with = "duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    timeout: Option<Duration>,

    #[serde(default)]
    retry: RetryPolicy,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    env: HashMap<String, String>,

    #[serde(default)]
    continue_on_error: bool,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let action = match (raw.run, raw.uses) {
            (Some(command), None) => {
                if !raw.with.is_empty() {
                    return Err("'with' parameters only apply to 'uses' steps".into());
                }
                StepAction::Run {
                    command,
                    shell: raw.shell.unwrap_or_else(default_shell),
                }
            }
            (None, Some(action)) => StepAction::Uses {
                action,
                with: raw
                    .with
                    .into_iter()
                    .map(|(k, v)| (k, String::from(v)))
                    .collect(),
            },
            (Some(_), Some(_)) => return Err("a step cannot set both 'run' and 'uses'".into()),
            (None, None) => return Err("a step must set either 'run' or 'uses'".into()),
        };

        Ok(Self {
            name: raw.name,
            action,
            condition: raw.condition,
            timeout: raw.timeout,
            retry: raw.retry,
            env: raw.env,
            continue_on_error: raw.continue_on_error,
        })
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        let (run, shell, uses, with) = match step.action {
            StepAction::Run { command, shell } => (Some(command), Some(shell), None, BTreeMap::new()),
            StepAction::Uses { action, with } => (
                None,
                None,
                Some(action),
                with.into_iter().map(|(k, v)| (k, ParamValue::Str(v))).collect(),
            ),
        };

        Self {
            name: step.name,
            run,
            shell,
            uses,
            with,
            condition: step.condition,
            timeout: step.timeout,
            retry: step.retry,
            env: step.env,
            continue_on_error: step.continue_on_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let yaml = r#"
name: "ci"
jobs:
  - name: build
    steps:
      - run: cargo build
"#;

        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name, "ci");
        assert_eq!(def.jobs.len(), 1);
        assert_eq!(def.protected_branches, vec!["main".to_string()]);
        match &def.jobs[0].steps[0].action {
            StepAction::Run { command, shell } => {
                assert_eq!(command, "cargo build");
                assert_eq!(shell, "bash");
            }
            _ => panic!("Expected run step"),
        }
    }

    #[test]
    fn test_parse_full_job() {
        let yaml = r#"
name: ci
concurrency:
  group: "${{ workflow }}-${{ ref }}"
jobs:
  - name: build
    steps:
      - uses: upload-artifact
        with:
          name: bin
          path: target/app
          retention: 3
  - name: test
    needs: [build]
    if: "event != 'schedule'"
    continue_on_error: true
    timeout: 30m
    steps:
      - name: unit tests
        run: cargo test
        timeout: 90s
        retry:
          max_attempts: 3
          delay: 250ms
          fatal_exit_codes: [2]
"#;

        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        let concurrency = def.concurrency.as_ref().unwrap();
        assert!(concurrency.cancel_in_progress);

        let build = def.get_job("build").unwrap();
        assert!(build.uses_action("upload-artifact"));
        match &build.steps[0].action {
            StepAction::Uses { with, .. } => assert_eq!(with["retention"], "3"),
            _ => panic!("Expected uses step"),
        }

        let test = def.get_job("test").unwrap();
        assert_eq!(test.needs, vec!["build".to_string()]);
        assert!(test.continue_on_error);
        assert_eq!(test.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(test.condition.as_ref().unwrap().source(), "event != 'schedule'");

        let step = &test.steps[0];
        assert_eq!(step.display_name(), "unit tests");
        assert_eq!(step.timeout, Some(Duration::from_secs(90)));
        assert_eq!(step.retry.max_attempts, 3);
        assert_eq!(step.retry.delay, Some(Duration::from_millis(250)));
        assert_eq!(step.retry.fatal_exit_codes, vec![2]);
        assert!(step.retry.retry_on_timeout);
    }

    #[test]
    fn test_step_must_be_run_or_uses() {
        let both = r#"
name: ci
jobs:
  - name: build
    steps:
      - run: make
        uses: checkout
"#;
        assert!(PipelineDefinition::from_yaml(both).is_err());

        let neither = r#"
name: ci
jobs:
  - name: build
    steps:
      - name: nothing
"#;
        assert!(PipelineDefinition::from_yaml(neither).is_err());
    }

    #[test]
    fn test_invalid_condition_is_a_parse_error() {
        let yaml = r#"
name: ci
jobs:
  - name: build
    if: "event = 'push'"
    steps:
      - run: make
"#;
        assert!(PipelineDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_round_trip_yaml() {
        let yaml = r#"
name: ci
jobs:
  - name: build
    timeout: 10m
    steps:
      - run: make
        retry: { max_attempts: 2 }
      - uses: upload-artifact
        with: { name: bin, path: out/bin }
"#;

        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        let parsed = PipelineDefinition::from_yaml(&def.to_yaml().unwrap()).unwrap();

        assert_eq!(parsed.name, def.name);
        assert_eq!(parsed.jobs[0].timeout, def.jobs[0].timeout);
        assert_eq!(parsed.jobs[0].steps[0].retry, def.jobs[0].steps[0].retry);
        assert_eq!(parsed.jobs[0].steps[1].action, def.jobs[0].steps[1].action);
    }

    #[test]
    fn test_display_name_truncates_long_commands() {
        let step = Step::run("cargo test --workspace --all-features --no-fail-fast -- --nocapture");
        assert!(step.display_name().ends_with("..."));
        assert_eq!(step.display_name().chars().count(), 40);
    }
}
