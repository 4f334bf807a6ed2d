// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Step executors
//!
//! This module provides the [`StepRunner`] trait and the implementations
//! used by the engine: shell commands, the built-in artifact actions and
//! external `jobflow-action-*` executables.

mod action;
mod shell;

pub use action::{ActionExecutor, DOWNLOAD_ARTIFACT, UPLOAD_ARTIFACT};
pub use shell::ShellExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::engine::{CancelSignal, RunId};
use crate::errors::{JobflowError, JobflowResult};
use crate::pipeline::{Pipeline, Step, StepAction};

/// Output of one step attempt
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Exit code (0 on success)
    pub exit_code: i32,

    /// Standard output, with masked values redacted
    pub stdout: String,

    /// Standard error, with masked values redacted
    pub stderr: String,

    /// Artifacts written by the step
    pub artifacts: Vec<String>,
}

impl StepOutput {
    /// Create a successful output
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Create a failed output
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything a step can see while running
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub job: String,
    pub pipeline: Arc<Pipeline>,
    pub workspace: PathBuf,
    /// Definition, job and step env merged in that order
    pub env: HashMap<String, String>,
    /// Values redacted from captured output
    pub masked: Vec<String>,
    pub cancel: CancelSignal,
    pub artifacts: Arc<ArtifactStore>,
}

impl StepContext {
    /// Redact masked values from text
    pub fn mask(&self, text: &str) -> String {
        mask(text, &self.masked)
    }
}

/// Redact every non-empty secret from `text`
pub fn mask(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "***"))
}

/// Runs a single attempt of a step
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute the step once
    ///
    /// A non-zero exit is reported through [`StepOutput::exit_code`]; `Err`
    /// is reserved for failures to run the step at all.
    async fn run(&self, step: &Step, ctx: &StepContext) -> JobflowResult<StepOutput>;
}

/// Dispatches `run` steps to the shell and `uses` steps to actions
#[derive(Default)]
pub struct DefaultRunner {
    shell: ShellExecutor,
    actions: ActionExecutor,
}

impl DefaultRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepRunner for DefaultRunner {
    async fn run(&self, step: &Step, ctx: &StepContext) -> JobflowResult<StepOutput> {
        match &step.action {
            StepAction::Run { command, shell } => self.shell.execute(command, shell, ctx).await,
            StepAction::Uses { action, with } => self.actions.execute(action, with, ctx).await,
        }
    }
}

/// Resolve glob patterns to file paths
pub fn resolve_globs(patterns: &[&str], base_dir: &Path) -> JobflowResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let full_pattern = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            base_dir.join(pattern).to_string_lossy().to_string()
        };

        let matches: Vec<_> = glob::glob(&full_pattern)?.filter_map(Result::ok).collect();

        if matches.is_empty() {
            return Err(JobflowError::NoMatchingFiles {
                pattern: pattern.to_string(),
            });
        }

        files.extend(matches);
    }

    Ok(files)
}
