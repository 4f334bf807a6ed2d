// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Run verdicts and reports

use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;

use super::state::{JobStatus, PipelineRun, RunId, SkipReason, StepResult};
use crate::trigger::RunContext;

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
    Cancelled,
}

impl Verdict {
    /// Process exit code for the CLI
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Cancelled => 2,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Per-job line of a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub status: JobStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub continue_on_error: bool,
    pub steps: Vec<StepResult>,
}

/// Job totals by terminal status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

/// Structured result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub group_key: String,
    pub context: RunContext,
    pub verdict: Verdict,
    /// Seconds since the Unix epoch
    pub started_at: u64,
    pub duration_ms: u64,
    pub counts: StatusCounts,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Turns a finished run into a verdict and report
pub struct ResultAggregator;

impl ResultAggregator {
    /// Failed if any job failed, else Cancelled if the run was cancelled,
    /// else Succeeded. `continue_on_error` only keeps dependents running.
    pub fn verdict(run: &PipelineRun) -> Verdict {
        let failed = run.jobs.iter().any(|j| j.status == JobStatus::Failed);

        if failed {
            Verdict::Failed
        } else if run.cancelled || run.jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
            Verdict::Cancelled
        } else {
            Verdict::Succeeded
        }
    }

    pub fn aggregate(run: &PipelineRun) -> RunReport {
        let mut counts = StatusCounts::default();

        let jobs: Vec<JobReport> = run
            .jobs
            .iter()
            .map(|job| {
                match job.status {
                    JobStatus::Succeeded => counts.succeeded += 1,
                    JobStatus::Failed => counts.failed += 1,
                    JobStatus::Cancelled => counts.cancelled += 1,
                    JobStatus::Skipped => counts.skipped += 1,
                    _ => {}
                }

                JobReport {
                    name: job.name.clone(),
                    status: job.status,
                    duration_ms: job.duration().as_millis() as u64,
                    failing_step: job.failing_step.clone(),
                    skip_reason: job.skip_reason.clone(),
                    error: job.error.clone(),
                    attempts: job.attempts(),
                    continue_on_error: job.continue_on_error,
                    steps: job.steps.clone(),
                }
            })
            .collect();

        RunReport {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            group_key: run.group_key.clone(),
            context: run.context.clone(),
            verdict: Self::verdict(run),
            started_at: run
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            duration_ms: run.duration.as_millis() as u64,
            counts,
            jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobExecution;
    use crate::trigger::EventKind;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    fn run(statuses: &[(&str, JobStatus)], cancelled: bool) -> PipelineRun {
        PipelineRun {
            id: 1,
            pipeline: "ci".into(),
            group_key: "ci-main".into(),
            context: RunContext {
                event: EventKind::Push,
                git_ref: "main".into(),
                draft: false,
                protected: true,
                actor: None,
                activity: None,
                variables: HashMap::new(),
                metadata: HashMap::new(),
            },
            jobs: statuses
                .iter()
                .map(|(name, status)| {
                    let mut job = JobExecution::new(*name);
                    job.finish(*status);
                    job
                })
                .collect(),
            cancelled,
            started_at: SystemTime::now(),
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_failure_with_skipped_dependents() {
        let run = run(
            &[
                ("build", JobStatus::Failed),
                ("lint", JobStatus::Skipped),
                ("test", JobStatus::Skipped),
            ],
            false,
        );

        let report = ResultAggregator::aggregate(&run);
        assert_eq!(report.verdict, Verdict::Failed);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.skipped, 2);
        assert_eq!(report.verdict.exit_code(), 1);
    }

    #[test]
    fn test_continue_on_error_failure_still_fails_run() {
        let mut run = run(
            &[("build", JobStatus::Succeeded), ("coverage", JobStatus::Failed)],
            false,
        );
        run.jobs[1].continue_on_error = true;

        let report = ResultAggregator::aggregate(&run);
        assert_eq!(report.verdict, Verdict::Failed);
        assert!(report.job("coverage").unwrap().continue_on_error);
    }

    #[test]
    fn test_cancelled_run() {
        let run = run(
            &[("build", JobStatus::Succeeded), ("test", JobStatus::Cancelled)],
            true,
        );

        let verdict = ResultAggregator::verdict(&run);
        assert_eq!(verdict, Verdict::Cancelled);
        assert_eq!(verdict.exit_code(), 2);
    }

    #[test]
    fn test_failure_outranks_cancellation() {
        let run = run(
            &[("build", JobStatus::Failed), ("test", JobStatus::Cancelled)],
            true,
        );

        assert_eq!(ResultAggregator::verdict(&run), Verdict::Failed);
    }

    #[test]
    fn test_report_serializes() {
        let run = run(&[("build", JobStatus::Succeeded)], false);
        let json = serde_json::to_value(ResultAggregator::aggregate(&run)).unwrap();

        assert_eq!(json["verdict"], "succeeded");
        assert_eq!(json["jobs"][0]["status"], "succeeded");
        assert_eq!(json["counts"]["succeeded"], 1);
    }
}
