// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Action executor
//!
//! Runs `uses:` steps. `upload-artifact` and `download-artifact` are built in
//! and talk to the run's artifact store; any other action is an executable
//! named `jobflow-action-<name>` on `PATH`, which receives its `with`
//! parameters as `INPUT_<NAME>` environment variables.

use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;

use super::shell::run_process;
use super::{resolve_globs, StepContext, StepOutput};
use crate::artifacts::ArtifactPayload;
use crate::errors::{JobflowError, JobflowResult};

pub const UPLOAD_ARTIFACT: &str = "upload-artifact";
pub const DOWNLOAD_ARTIFACT: &str = "download-artifact";

/// Action executor
#[derive(Debug, Default)]
pub struct ActionExecutor;

impl ActionExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        action: &str,
        with: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> JobflowResult<StepOutput> {
        match action {
            UPLOAD_ARTIFACT => self.upload(with, ctx).await,
            DOWNLOAD_ARTIFACT => self.download(with, ctx).await,
            other => self.external(other, with, ctx).await,
        }
    }

    async fn upload(
        &self,
        with: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> JobflowResult<StepOutput> {
        let name = required(UPLOAD_ARTIFACT, with, "name")?;

        let payload = match (with.get("content"), with.get("path")) {
            (Some(content), _) => ArtifactPayload::Bytes(content.as_bytes().to_vec()),
            (None, Some(path)) => {
                let patterns: Vec<&str> = split_patterns(path);
                ArtifactPayload::Files(resolve_globs(&patterns, &ctx.workspace)?)
            }
            (None, None) => {
                return Err(JobflowError::InvalidDefinition {
                    reason: format!("{} needs either 'path' or 'content'", UPLOAD_ARTIFACT),
                    help: None,
                })
            }
        };

        let size = payload.size();
        ctx.artifacts.put(ctx.run_id, name, &ctx.job, payload).await?;

        Ok(StepOutput {
            stdout: format!("Uploaded artifact '{}' ({} item(s))", name, size),
            artifacts: vec![name.to_string()],
            ..StepOutput::default()
        })
    }

    async fn download(
        &self,
        with: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> JobflowResult<StepOutput> {
        let name = required(DOWNLOAD_ARTIFACT, with, "name")?;

        let artifact = ctx
            .artifacts
            .get(ctx.run_id, name, &ctx.job, ctx.pipeline.graph())
            .await?;

        let Some(target) = with.get("path") else {
            return Ok(StepOutput::success(format!("Artifact '{}' is available", name)));
        };
        let target = ctx.workspace.join(target);

        match &artifact.payload {
            ArtifactPayload::Bytes(bytes) => {
                write_file(&target, bytes).await?;
            }
            ArtifactPayload::Files(files) => {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| file_write_error(&target, e))?;
                for file in files {
                    let Some(file_name) = file.file_name() else {
                        continue;
                    };
                    let dest = target.join(file_name);
                    tokio::fs::copy(file, &dest)
                        .await
                        .map_err(|e| JobflowError::FileReadError {
                            path: file.clone(),
                            error: e.to_string(),
                        })?;
                }
            }
        }

        Ok(StepOutput::success(format!(
            "Downloaded artifact '{}' to {}",
            name,
            target.display()
        )))
    }

    async fn external(
        &self,
        action: &str,
        with: &BTreeMap<String, String>,
        ctx: &StepContext,
    ) -> JobflowResult<StepOutput> {
        let binary = which::which(format!("jobflow-action-{}", action))
            .map_err(|_| JobflowError::action_not_found(action))?;

        let mut cmd = Command::new(binary);
        for (key, value) in with {
            cmd.env(input_var(key), value);
        }

        run_process(cmd, ctx).await
    }
}

fn required<'a>(
    action: &str,
    with: &'a BTreeMap<String, String>,
    key: &str,
) -> JobflowResult<&'a str> {
    with.get(key)
        .map(String::as_str)
        .ok_or_else(|| JobflowError::InvalidDefinition {
            reason: format!("{} requires a '{}' parameter", action, key),
            help: None,
        })
}

fn split_patterns(value: &str) -> Vec<&str> {
    value
        .split(['\n', ','])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// `with` key to environment variable: `cache-key` → `INPUT_CACHE_KEY`
fn input_var(key: &str) -> String {
    format!("INPUT_{}", key.replace(['-', ' '], "_").to_uppercase())
}

fn file_write_error(path: &Path, e: std::io::Error) -> JobflowError {
    JobflowError::FileWriteError {
        path: path.to_path_buf(),
        error: e.to_string(),
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> JobflowResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| file_write_error(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| file_write_error(path, e))
}
