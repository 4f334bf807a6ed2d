// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Error types and diagnostics
//!
//! Every fallible operation in jobflow returns a [`JobflowError`]. Definition
//! problems are reported before any job is scheduled and map to their own CLI
//! exit code; step, artifact and history errors stay local to the job or
//! command that raised them.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for jobflow operations
pub type JobflowResult<T> = Result<T, JobflowError>;

/// Main error type for jobflow
#[derive(Error, Debug, Diagnostic)]
pub enum JobflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Definition Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline definition not found: {path}")]
    #[diagnostic(
        code(jobflow::definition_not_found),
        help("Pass the path of a pipeline YAML file, e.g. 'jobflow run ci.yaml --event push --ref main'")
    )]
    DefinitionNotFound { path: PathBuf },

    #[error("Invalid pipeline definition: {reason}")]
    #[diagnostic(code(jobflow::invalid_definition))]
    InvalidDefinition {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Job '{job}' is defined more than once")]
    #[diagnostic(
        code(jobflow::duplicate_job),
        help("Job names must be unique within a pipeline definition")
    )]
    DuplicateJob { job: String },

    #[error("Circular dependency detected between jobs: {}", jobs.join(" → "))]
    #[diagnostic(
        code(jobflow::circular_dependency),
        help("Review the 'needs' lists of these jobs to remove the cycle")
    )]
    CircularDependency { jobs: Vec<String> },

    #[error("Job '{job}' needs unknown job '{dependency}'")]
    #[diagnostic(
        code(jobflow::unknown_dependency),
        help("Check that '{dependency}' is defined in your pipeline")
    )]
    UnknownDependency { job: String, dependency: String },

    #[error("Invalid condition '{expression}': {reason}")]
    #[diagnostic(
        code(jobflow::invalid_condition),
        help("Conditions support ==, !=, &&, ||, !, parentheses, 'quoted' strings and needs.<job>.result")
    )]
    InvalidCondition { expression: String, reason: String },

    #[error("Invalid duration '{value}'")]
    #[diagnostic(
        code(jobflow::invalid_duration),
        help("Use a number of seconds or a suffixed value such as 250ms, 30s, 5m or 1h")
    )]
    InvalidDuration { value: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Action '{action}' not found")]
    #[diagnostic(code(jobflow::action_not_found), help("{suggestion}"))]
    ActionNotFound { action: String, suggestion: String },

    #[error("Step '{step}' failed after {attempts} attempt(s): {reason}")]
    #[diagnostic(code(jobflow::step_failed))]
    StepFailed {
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("Step '{step}' timed out after {:.2}s", timeout.as_secs_f64())]
    #[diagnostic(code(jobflow::step_timeout))]
    StepTimeout { step: String, timeout: Duration },

    #[error("Execution failed: {message}")]
    #[diagnostic(code(jobflow::execution_failed))]
    ExecutionFailed {
        message: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Artifact '{name}' not found in run {run}")]
    #[diagnostic(
        code(jobflow::artifact_not_found),
        help("Artifacts are only visible to jobs that (transitively) need the producing job")
    )]
    ArtifactNotFound { run: u64, name: String },

    #[error("Artifact '{name}' was already written in run {run}")]
    #[diagnostic(
        code(jobflow::duplicate_artifact),
        help("Each artifact name may be written by exactly one job per run")
    )]
    DuplicateArtifact { run: u64, name: String },

    #[error("Artifact storage error: {message}")]
    #[diagnostic(code(jobflow::artifact_storage))]
    ArtifactStorage { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(jobflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(jobflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("No files matched pattern: {pattern}")]
    #[diagnostic(
        code(jobflow::no_matching_files),
        help("Check that files matching '{pattern}' exist in the workspace")
    )]
    NoMatchingFiles { pattern: String },

    #[error("Run history error: {message}")]
    #[diagnostic(code(jobflow::history_error))]
    HistoryError { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(jobflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(jobflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(jobflow::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(jobflow::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(jobflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for JobflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for JobflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for JobflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for JobflowError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for JobflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl JobflowError {
    /// Create an action-not-found error with an installation hint
    pub fn action_not_found(action: &str) -> Self {
        let suggestion = format!(
            "Install an executable named 'jobflow-action-{}' and ensure it's in your PATH",
            action
        );

        Self::ActionNotFound {
            action: action.to_string(),
            suggestion,
        }
    }

    /// Whether this error means the definition itself is unusable.
    ///
    /// Such errors abort a run before scheduling begins.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DefinitionNotFound { .. }
                | Self::InvalidDefinition { .. }
                | Self::DuplicateJob { .. }
                | Self::CircularDependency { .. }
                | Self::UnknownDependency { .. }
                | Self::InvalidCondition { .. }
                | Self::InvalidDuration { .. }
                | Self::Yaml { .. }
        )
    }

    /// Whether retrying the failed step could possibly help
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ArtifactNotFound { .. }
                | Self::DuplicateArtifact { .. }
                | Self::InvalidDefinition { .. }
                | Self::ActionNotFound { .. }
                | Self::NoMatchingFiles { .. }
                | Self::GlobPattern { .. }
        )
    }

    /// Suggest how to recover from this error, where a concrete fix exists
    pub fn recovery(&self) -> Option<RecoverySuggestion> {
        match self {
            Self::CircularDependency { jobs } => {
                Some(RecoverySuggestion::fix_circular_dependency(jobs))
            }
            Self::UnknownDependency { job, dependency } => {
                Some(RecoverySuggestion::fix_unknown_dependency(job, dependency))
            }
            Self::DuplicateJob { job } => Some(RecoverySuggestion::rename_duplicate_job(job)),
            Self::ActionNotFound { action, .. } => Some(RecoverySuggestion::install_action(action)),
            Self::Yaml { message } => {
                let (line, column) = yaml_location(message);
                Some(RecoverySuggestion::fix_yaml_syntax(line, column))
            }
            _ => None,
        }
    }
}

/// Pull "line N column M" out of a serde_yaml error message
fn yaml_location(message: &str) -> (Option<usize>, Option<usize>) {
    let number_after = |marker: &str| {
        message.find(marker).and_then(|pos| {
            message[pos + marker.len()..]
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .and_then(|n| n.parse().ok())
        })
    };

    (number_after("line "), number_after("column "))
}
