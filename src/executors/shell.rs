// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Shell executor
//!
//! Executes `run` steps through a shell, and provides the process plumbing
//! shared with external actions.

use std::process::Stdio;
use tokio::process::Command;

use super::{StepContext, StepOutput};
use crate::errors::{JobflowError, JobflowResult};

/// Shell executor
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    /// Create a new shell executor
    pub fn new() -> Self {
        Self
    }

    /// Run `command` with `shell -c` in the step's workspace
    pub async fn execute(
        &self,
        command: &str,
        shell: &str,
        ctx: &StepContext,
    ) -> JobflowResult<StepOutput> {
        if command.trim().is_empty() {
            return Err(JobflowError::ExecutionFailed {
                message: "shell command is empty".into(),
                help: None,
            });
        }

        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command);

        run_process(cmd, ctx).await.map_err(|e| match e {
            JobflowError::Io { message } => JobflowError::ExecutionFailed {
                message,
                help: Some(format!("Shell '{}' may not be available", shell)),
            },
            other => other,
        })
    }
}

/// Spawn a prepared command and wait for it, honouring cancellation
///
/// The command runs in its own process group. On cancellation the group gets
/// SIGTERM and this future keeps waiting; the caller bounds that wait with
/// the shutdown grace period. If the future is dropped before the command
/// exits (timeout, grace expiry) the whole group gets SIGKILL.
pub(crate) async fn run_process(mut cmd: Command, ctx: &StepContext) -> JobflowResult<StepOutput> {
    cmd.current_dir(&ctx.workspace)
        .envs(&ctx.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    let mut group = ProcessGroup::new(child.id());

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let output = tokio::select! {
        output = &mut wait => output?,
        _ = ctx.cancel.cancelled() => {
            tracing::debug!(job = %ctx.job, pid = group.pid, "cancellation requested, terminating step");
            group.terminate();
            (&mut wait).await?
        }
    };
    group.release();

    let stdout = ctx.mask(&String::from_utf8_lossy(&output.stdout));
    let stderr = ctx.mask(&String::from_utf8_lossy(&output.stderr));

    for line in stdout.lines() {
        tracing::debug!(job = %ctx.job, "{}", line);
    }

    Ok(StepOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr,
        artifacts: Vec::new(),
    })
}

/// The process group of a running step; killed on drop unless released
struct ProcessGroup {
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// Ask every process of the step to stop
    #[cfg(unix)]
    fn terminate(&self) {
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}

    #[cfg(unix)]
    fn kill(&self) {
        if self.pid.is_some() {
            tracing::debug!(pid = self.pid, "killing abandoned step process group");
            self.signal(nix::sys::signal::Signal::SIGKILL);
        }
    }

    // Off unix, kill_on_drop covers the direct child
    #[cfg(not(unix))]
    fn kill(&self) {}

    /// The step exited on its own; leave the group alone
    fn release(&mut self) {
        self.pid = None;
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };

        match nix::sys::signal::killpg(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid, %signal, "failed to signal process group: {}", e),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::engine::CancelSignal;
    use crate::pipeline::{Pipeline, PipelineDefinition};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn context(workspace: &std::path::Path) -> StepContext {
        let def = PipelineDefinition::from_yaml(
            "name: t\njobs:\n  - name: job\n    steps: [{ run: \"true\" }]\n",
        )
        .unwrap();

        StepContext {
            run_id: 1,
            job: "job".into(),
            pipeline: Arc::new(Pipeline::new(def).unwrap()),
            workspace: workspace.to_path_buf(),
            env: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            masked: vec!["s3cret".into()],
            cancel: CancelSignal::new(),
            artifacts: Arc::new(ArtifactStore::in_memory(Duration::from_secs(60))),
        }
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());

        let output = ShellExecutor::new()
            .execute("echo $GREETING; echo s3cret", "sh", &ctx)
            .await
            .unwrap();

        assert!(output.is_success());
        assert!(output.stdout.contains("hello"));
        assert!(output.stdout.contains("***"));
        assert!(!output.stdout.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());

        let output = ShellExecutor::new()
            .execute("echo oops >&2; exit 3", "sh", &ctx)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(output.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_empty_command_fails() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());

        assert!(ShellExecutor::new().execute("  ", "sh", &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_terminates_command() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let output = ShellExecutor::new()
            .execute("sleep 30", "sh", &ctx)
            .await
            .unwrap();

        assert!(!output.is_success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_abandoned_step_kills_background_processes() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let marker = temp.path().join("marker");

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            ShellExecutor::new().execute("(sleep 1; touch marker) & wait", "sh", &ctx),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_cancellation_reaches_whole_group() {
        let temp = TempDir::new().unwrap();
        let ctx = context(temp.path());
        let cancel = ctx.cancel.clone();
        let marker = temp.path().join("marker");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let output = ShellExecutor::new()
            .execute("(sleep 1; touch marker) & wait", "sh", &ctx)
            .await
            .unwrap();
        assert!(!output.is_success());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
