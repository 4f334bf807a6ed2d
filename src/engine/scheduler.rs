// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Job scheduler
//!
//! Walks the job graph of one run. Jobs are promoted through
//! `Pending → Waiting → Runnable` as their needs finish, started in
//! topological order while execution slots are free, and the runnable set is
//! re-evaluated every time a job reaches a terminal state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::retry::RetryExecutor;
use super::state::{
    CancelSignal, JobExecution, JobStatus, PipelineRun, RunId, SkipReason, StepResult, StepStatus,
};
use crate::artifacts::ArtifactStore;
use crate::condition::ConditionContext;
use crate::executors::StepContext;
use crate::pipeline::{duration::format_duration, Pipeline};
use crate::trigger::RunContext;

/// Drives every job of a run to a terminal state
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    retry: RetryExecutor,
    artifacts: Arc<ArtifactStore>,
    max_parallel: usize,
    workspace: PathBuf,
}

/// What a finished job task reports back
struct JobOutcome {
    status: JobStatus,
    steps: Vec<StepResult>,
    artifacts: Vec<String>,
    failing_step: Option<String>,
    error: Option<String>,
}

impl JobOutcome {
    fn crashed(message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            steps: Vec::new(),
            artifacts: Vec::new(),
            failing_step: None,
            error: Some(message),
        }
    }
}

/// Everything a job task owns while it runs
struct JobTask {
    idx: usize,
    run_id: RunId,
    pipeline: Arc<Pipeline>,
    retry: RetryExecutor,
    artifacts: Arc<ArtifactStore>,
    context: Arc<RunContext>,
    results: HashMap<String, JobStatus>,
    cancel: CancelSignal,
    workspace: PathBuf,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        retry: RetryExecutor,
        artifacts: Arc<ArtifactStore>,
        max_parallel: usize,
        workspace: PathBuf,
    ) -> Self {
        Self {
            pipeline,
            retry,
            artifacts,
            max_parallel: max_parallel.max(1),
            workspace,
        }
    }

    /// Execute one run until every job is terminal
    pub async fn execute(
        &self,
        run_id: RunId,
        group_key: String,
        context: RunContext,
        cancel: CancelSignal,
    ) -> PipelineRun {
        let definition = self.pipeline.definition();
        let started_at = SystemTime::now();
        let start = Instant::now();
        let context = Arc::new(context);

        let mut jobs: Vec<JobExecution> = definition
            .jobs
            .iter()
            .map(|job| {
                let mut exec = JobExecution::new(&job.name);
                exec.continue_on_error = job.continue_on_error;
                exec
            })
            .collect();
        let mut results: HashMap<String, JobStatus> = HashMap::new();
        let mut join_set: JoinSet<(usize, JobOutcome)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                tracing::info!(run = run_id, "run cancelled, no further jobs will start");
                Self::cancel_unstarted(&mut jobs, &mut results);
            }

            if !cancelled {
                self.promote(&mut jobs, &mut results, &context);

                for &idx in self.pipeline.execution_order() {
                    if join_set.len() >= self.max_parallel {
                        break;
                    }
                    if jobs[idx].status != JobStatus::Runnable {
                        continue;
                    }

                    jobs[idx].mark_running();
                    tracing::info!(run = run_id, job = %jobs[idx].name, "job started");

                    let task = JobTask {
                        idx,
                        run_id,
                        pipeline: self.pipeline.clone(),
                        retry: self.retry.clone(),
                        artifacts: self.artifacts.clone(),
                        context: context.clone(),
                        results: results.clone(),
                        cancel: cancel.clone(),
                        workspace: self.workspace.clone(),
                    };
                    let span = tracing::info_span!("job", run = run_id, name = %jobs[idx].name);

                    join_set.spawn(async move {
                        // Inner task so a panicking job still reports its index
                        let handle = tokio::spawn(run_job(task).instrument(span));
                        let outcome = handle
                            .await
                            .unwrap_or_else(|e| JobOutcome::crashed(format!("job task failed: {}", e)));
                        (idx, outcome)
                    });
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((idx, outcome))) => {
                        Self::record(run_id, &mut jobs[idx], outcome, &mut results);
                    }
                    Some(Err(e)) => {
                        tracing::error!(run = run_id, "job supervisor task failed: {}", e);
                    }
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {}
            }
        }

        // Only reachable if a supervisor task itself died
        for job in jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
            job.error = Some("job ended without reporting a result".into());
            job.finish(JobStatus::Failed);
        }

        PipelineRun {
            id: run_id,
            pipeline: definition.name.clone(),
            group_key,
            context: Arc::try_unwrap(context).unwrap_or_else(|shared| (*shared).clone()),
            jobs,
            cancelled,
            started_at,
            duration: start.elapsed(),
        }
    }

    /// Advance waiting jobs whose needs are all terminal
    ///
    /// Jobs are visited in topological order, so a skip decided here is seen
    /// by later dependents in the same pass.
    fn promote(
        &self,
        jobs: &mut [JobExecution],
        results: &mut HashMap<String, JobStatus>,
        context: &RunContext,
    ) {
        let definition = self.pipeline.definition();

        for &idx in self.pipeline.execution_order() {
            if !matches!(jobs[idx].status, JobStatus::Pending | JobStatus::Waiting) {
                continue;
            }

            let job = &definition.jobs[idx];
            if job.needs.iter().any(|need| !results.contains_key(need)) {
                if jobs[idx].status == JobStatus::Pending {
                    tracing::trace!(job = %job.name, "waiting on needs");
                    jobs[idx].status = JobStatus::Waiting;
                }
                continue;
            }

            if let Some(blocker) = self.blocking_dependency(idx, jobs) {
                tracing::info!(job = %job.name, dependency = %blocker, "job skipped, dependency did not succeed");
                jobs[idx].skip(SkipReason::DependencyFailed { job: blocker });
                results.insert(job.name.clone(), JobStatus::Skipped);
                continue;
            }

            let run = job.condition.as_ref().map_or(true, |condition| {
                condition.evaluate(&ConditionContext::new(context, results))
            });

            if run {
                jobs[idx].status = JobStatus::Runnable;
            } else {
                tracing::info!(job = %job.name, "job skipped, condition is false");
                jobs[idx].skip(SkipReason::Condition);
                results.insert(job.name.clone(), JobStatus::Skipped);
            }
        }
    }

    /// The failed job that prevents `idx` from running, if any
    ///
    /// A need that failed or was cancelled blocks unless it is marked
    /// `continue_on_error`; a need skipped because of its own failed
    /// dependency passes that root failure on.
    fn blocking_dependency(&self, idx: usize, jobs: &[JobExecution]) -> Option<String> {
        let definition = self.pipeline.definition();

        definition.jobs[idx].needs.iter().find_map(|need| {
            let need_idx = definition.jobs.iter().position(|j| &j.name == need)?;
            let exec = &jobs[need_idx];

            match (&exec.status, &exec.skip_reason) {
                (JobStatus::Failed | JobStatus::Cancelled, _) if !exec.continue_on_error => {
                    Some(need.clone())
                }
                (JobStatus::Skipped, Some(SkipReason::DependencyFailed { job })) => Some(job.clone()),
                _ => None,
            }
        })
    }

    fn cancel_unstarted(jobs: &mut [JobExecution], results: &mut HashMap<String, JobStatus>) {
        for job in jobs.iter_mut() {
            if job.status.is_terminal() || job.status == JobStatus::Running {
                continue;
            }
            job.finish(JobStatus::Cancelled);
            results.insert(job.name.clone(), JobStatus::Cancelled);
        }
    }

    fn record(
        run_id: RunId,
        job: &mut JobExecution,
        outcome: JobOutcome,
        results: &mut HashMap<String, JobStatus>,
    ) {
        job.steps = outcome.steps;
        job.artifacts = outcome.artifacts;
        job.failing_step = outcome.failing_step;
        job.error = outcome.error;
        job.finish(outcome.status);
        results.insert(job.name.clone(), outcome.status);

        match outcome.status {
            JobStatus::Failed => tracing::warn!(
                run = run_id,
                job = %job.name,
                step = job.failing_step.as_deref().unwrap_or("-"),
                "job failed"
            ),
            status => tracing::info!(run = run_id, job = %job.name, %status, "job finished"),
        }
    }
}

/// Run the steps of one job in order
async fn run_job(task: JobTask) -> JobOutcome {
    let definition = task.pipeline.definition();
    let job = &definition.jobs[task.idx];
    let deadline = job.timeout.map(|t| Instant::now() + t);

    let mut outcome = JobOutcome {
        status: JobStatus::Succeeded,
        steps: Vec::new(),
        artifacts: Vec::new(),
        failing_step: None,
        error: None,
    };

    for step in &job.steps {
        if task.cancel.is_cancelled() {
            outcome.status = JobStatus::Cancelled;
            return outcome;
        }

        if let Some(error) = job_timeout_error(deadline, job.timeout) {
            outcome.status = JobStatus::Failed;
            outcome.failing_step = Some(step.display_name());
            outcome.error = Some(error);
            return outcome;
        }

        if let Some(condition) = &step.condition {
            let ctx = ConditionContext::new(&task.context, &task.results);
            if !condition.evaluate(&ctx) {
                tracing::debug!(step = %step.display_name(), "step skipped, condition is false");
                outcome.steps.push(StepResult::skipped(step.display_name()));
                continue;
            }
        }

        let ctx = step_context(&task, step);
        let result = task.retry.run(step, &step.retry, &ctx, deadline).await;

        outcome.artifacts.extend(result.artifacts.iter().cloned());
        let status = result.status;
        let fails_job = result.fails_job();
        let name = result.name.clone();
        let error = result.error.clone();
        outcome.steps.push(result);

        match status {
            StepStatus::Cancelled => {
                outcome.status = JobStatus::Cancelled;
                return outcome;
            }
            StepStatus::Failed => {
                // A continue-on-error step cut off by the job deadline still fails the job
                let timed_out = job_timeout_error(deadline, job.timeout);
                if fails_job || timed_out.is_some() {
                    outcome.status = JobStatus::Failed;
                    outcome.failing_step = Some(name);
                    outcome.error = timed_out.or(error);
                    return outcome;
                }
            }
            _ => {}
        }
    }

    outcome
}

/// Error for a job whose deadline has passed
fn job_timeout_error(deadline: Option<Instant>, timeout: Option<Duration>) -> Option<String> {
    match (deadline, timeout) {
        (Some(deadline), Some(timeout)) if Instant::now() >= deadline => Some(format!(
            "job exceeded its timeout of {}",
            format_duration(timeout)
        )),
        _ => None,
    }
}

/// Environment and handles for one step
fn step_context(task: &JobTask, step: &crate::pipeline::Step) -> StepContext {
    let definition = task.pipeline.definition();
    let job = &definition.jobs[task.idx];

    let mut env = HashMap::from([
        ("JOBFLOW_RUN_ID".to_string(), task.run_id.to_string()),
        ("JOBFLOW_PIPELINE".to_string(), definition.name.clone()),
        ("JOBFLOW_JOB".to_string(), job.name.clone()),
        ("JOBFLOW_EVENT".to_string(), task.context.event.to_string()),
        ("JOBFLOW_REF".to_string(), task.context.git_ref.clone()),
    ]);
    env.extend(definition.env.clone());
    env.extend(job.env.clone());
    env.extend(step.env.clone());

    let masked = definition
        .mask_env
        .iter()
        .filter_map(|name| env.get(name).cloned().or_else(|| std::env::var(name).ok()))
        .collect();

    StepContext {
        run_id: task.run_id,
        job: job.name.clone(),
        pipeline: task.pipeline.clone(),
        workspace: task.workspace.clone(),
        env,
        masked,
        cancel: task.cancel.clone(),
        artifacts: task.artifacts.clone(),
    }
}
