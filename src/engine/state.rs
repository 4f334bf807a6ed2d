// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Run, job and step state

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

use crate::trigger::RunContext;

/// Identifier of a pipeline run, unique within an engine
pub type RunId = u64;

/// Lifecycle of a job within a run
///
/// `Pending → Waiting → Runnable → Running → {Succeeded, Failed, Cancelled}`,
/// with `Skipped` reachable from `Waiting` and `Runnable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Waiting,
    Runnable,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Parse the result names used in `needs.<job>.result` comparisons
    pub fn from_result_name(name: &str) -> Option<Self> {
        match name {
            "success" | "succeeded" => Some(Self::Succeeded),
            "failure" | "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job or step did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Its `if` condition evaluated to false
    Condition,
    /// A needed job failed or was cancelled
    DependencyFailed { job: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Condition => write!(f, "condition was false"),
            Self::DependencyFailed { job } => write!(f, "dependency '{}' did not succeed", job),
        }
    }
}

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

/// Result of running one step, including every retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// A failure of this step does not fail the job
    pub continue_on_error: bool,
    /// Artifacts written by the step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl StepResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            attempts: 0,
            duration: Duration::ZERO,
            exit_code: None,
            error: None,
            continue_on_error: false,
            artifacts: Vec::new(),
        }
    }

    /// Whether this result should fail the enclosing job
    pub fn fails_job(&self) -> bool {
        self.status == StepStatus::Failed && !self.continue_on_error
    }
}

/// State of one job in a run
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub name: String,
    pub status: JobStatus,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub steps: Vec<StepResult>,
    /// Names of artifacts this job wrote
    pub artifacts: Vec<String>,
    pub failing_step: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<String>,
    /// A failure of this job neither skips dependents nor fails the run
    pub continue_on_error: bool,
}

impl JobExecution {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::Pending,
            started: None,
            finished: None,
            started_at: None,
            finished_at: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
            failing_step: None,
            skip_reason: None,
            error: None,
            continue_on_error: false,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started = Some(Instant::now());
        self.started_at = Some(SystemTime::now());
    }

    /// Move to a terminal status, stamping the finish time
    pub fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished = Some(Instant::now());
        self.finished_at = Some(SystemTime::now());
    }

    pub fn skip(&mut self, reason: SkipReason) {
        self.skip_reason = Some(reason);
        self.finish(JobStatus::Skipped);
    }

    /// Wall time spent running; zero for jobs that never started
    pub fn duration(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Total attempts across all steps
    pub fn attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }
}

/// One instantiation of a pipeline against an event
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub group_key: String,
    pub context: RunContext,
    /// Jobs in definition order
    pub jobs: Vec<JobExecution>,
    /// The run was cancelled, by supersession or by the caller
    pub cancelled: bool,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl PipelineRun {
    pub fn job(&self, name: &str) -> Option<&JobExecution> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Cooperative cancellation flag shared by everything working on a run
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender is owned by this signal, so this only happens during teardown
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_result_names() {
        assert_eq!(JobStatus::from_result_name("success"), Some(JobStatus::Succeeded));
        assert_eq!(JobStatus::from_result_name("failure"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::from_result_name("running"), None);
    }

    #[test]
    fn test_skip_reason_serialization() {
        let json = serde_json::to_string(&SkipReason::DependencyFailed { job: "build".into() })
            .unwrap();
        assert_eq!(json, r#"{"kind":"dependency_failed","job":"build"}"#);
    }

    #[tokio::test]
    async fn test_cancel_signal_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.is_cancelled()
        });

        signal.cancel();
        assert!(handle.await.unwrap());
    }
}
