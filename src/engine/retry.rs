// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Retry and timeout handling for steps
//!
//! A step runs up to `max_attempts` times. Each attempt is bounded by the
//! earlier of the step timeout and the job deadline. Exit codes listed in
//! `fatal_exit_codes`, timeouts with `retry_on_timeout: false` and
//! non-retryable errors (missing actions, artifact errors) end the step at
//! once. Cancellation is observed before each attempt, during inter-attempt
//! delays and while an attempt runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::state::{StepResult, StepStatus};
use crate::errors::JobflowError;
use crate::executors::{StepContext, StepOutput, StepRunner};
use crate::pipeline::{RetryPolicy, Step};

/// Why an attempt failed
#[derive(Debug)]
pub enum AttemptFailure {
    ExitCode { code: i32, stderr: String },
    Timeout(Duration),
    Error(JobflowError),
}

impl AttemptFailure {
    /// Whether another attempt is pointless under `policy`
    pub fn is_fatal(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::ExitCode { code, .. } => policy.fatal_exit_codes.contains(code),
            Self::Timeout(_) => !policy.retry_on_timeout,
            Self::Error(e) => !e.is_retryable(),
        }
    }

    fn describe(&self, step: &str) -> String {
        match self {
            Self::ExitCode { code, stderr } => match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(last) => format!("exit code {}: {}", code, last.trim()),
                None => format!("exit code {}", code),
            },
            Self::Timeout(timeout) => JobflowError::StepTimeout {
                step: step.to_string(),
                timeout: *timeout,
            }
            .to_string(),
            Self::Error(e) => e.to_string(),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitCode { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Progress through a step's attempts
#[derive(Debug, Default)]
pub struct RetryState {
    attempt: u32,
    next_eligible: Option<Instant>,
    last_failure: Option<AttemptFailure>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.last_failure.as_ref()
    }

    /// Earliest instant the next attempt may start
    pub fn next_eligible(&self) -> Option<Instant> {
        self.next_eligible
    }

    fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.next_eligible = None;
    }

    /// Record a failure; returns whether another attempt is allowed
    fn record_failure(&mut self, failure: AttemptFailure, policy: &RetryPolicy) -> bool {
        let retry = !failure.is_fatal(policy) && self.attempt < policy.max_attempts;
        if retry {
            self.next_eligible = Some(Instant::now() + policy.delay.unwrap_or_default());
        }
        self.last_failure = Some(failure);
        retry
    }
}

enum AttemptOutcome {
    Output(StepOutput),
    Failed(JobflowError),
    TimedOut(Duration),
    Cancelled,
}

/// Runs steps under their retry policy
#[derive(Clone)]
pub struct RetryExecutor {
    runner: Arc<dyn StepRunner>,
    grace: Duration,
}

impl RetryExecutor {
    /// `grace` bounds how long a cancelled attempt may take to stop
    pub fn new(runner: Arc<dyn StepRunner>, grace: Duration) -> Self {
        Self { runner, grace }
    }

    /// Run a step to completion under `policy`
    ///
    /// `deadline` is the enclosing job's deadline, if it has one.
    pub async fn run(
        &self,
        step: &Step,
        policy: &RetryPolicy,
        ctx: &StepContext,
        deadline: Option<Instant>,
    ) -> StepResult {
        let name = step.display_name();
        let start = Instant::now();
        let mut state = RetryState::new();

        let finish = |status: StepStatus, state: &RetryState, output: Option<StepOutput>| {
            let error = match status {
                StepStatus::Failed => state.last_failure().map(|f| {
                    JobflowError::StepFailed {
                        step: name.clone(),
                        attempts: state.attempt(),
                        reason: f.describe(&name),
                    }
                    .to_string()
                }),
                StepStatus::Cancelled => Some("cancelled".to_string()),
                _ => None,
            };

            StepResult {
                name: name.clone(),
                status,
                attempts: state.attempt(),
                duration: start.elapsed(),
                exit_code: match &output {
                    Some(o) => Some(o.exit_code),
                    None => state.last_failure().and_then(AttemptFailure::exit_code),
                },
                error,
                continue_on_error: step.continue_on_error,
                artifacts: output.map(|o| o.artifacts).unwrap_or_default(),
            }
        };

        loop {
            if ctx.cancel.is_cancelled() {
                return finish(StepStatus::Cancelled, &state, None);
            }

            state.begin_attempt();
            let limit = attempt_limit(step.timeout, deadline);

            tracing::debug!(
                job = %ctx.job,
                step = %name,
                attempt = state.attempt(),
                max_attempts = policy.max_attempts,
                "starting attempt"
            );

            let failure = match self.attempt(step, ctx, limit).await {
                AttemptOutcome::Output(output) if output.is_success() => {
                    return finish(StepStatus::Succeeded, &state, Some(output));
                }
                AttemptOutcome::Output(output) => AttemptFailure::ExitCode {
                    code: output.exit_code,
                    stderr: output.stderr,
                },
                AttemptOutcome::Failed(e) => AttemptFailure::Error(e),
                AttemptOutcome::TimedOut(after) => AttemptFailure::Timeout(after),
                AttemptOutcome::Cancelled => return finish(StepStatus::Cancelled, &state, None),
            };

            let reason = failure.describe(&name);
            let deadline_passed = deadline.is_some_and(|d| Instant::now() >= d);

            if !state.record_failure(failure, policy) || deadline_passed {
                tracing::warn!(job = %ctx.job, step = %name, attempts = state.attempt(), "step failed: {}", reason);
                return finish(StepStatus::Failed, &state, None);
            }

            tracing::info!(
                job = %ctx.job,
                step = %name,
                attempt = state.attempt(),
                max_attempts = policy.max_attempts,
                "attempt failed, retrying: {}",
                reason
            );

            if let Some(eligible) = state.next_eligible() {
                tokio::select! {
                    _ = tokio::time::sleep_until(eligible.into()) => {}
                    _ = ctx.cancel.cancelled() => {
                        return finish(StepStatus::Cancelled, &state, None);
                    }
                }
            }
        }
    }

    async fn attempt(&self, step: &Step, ctx: &StepContext, limit: Option<Duration>) -> AttemptOutcome {
        let run = self.runner.run(step, ctx);
        tokio::pin!(run);

        let timer = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        tokio::select! {
            result = &mut run => match result {
                Ok(output) => AttemptOutcome::Output(output),
                Err(e) => AttemptOutcome::Failed(e),
            },
            _ = &mut timer => AttemptOutcome::TimedOut(limit.unwrap_or_default()),
            _ = ctx.cancel.cancelled() => {
                // Let the runner wind down; dropping it afterwards kills the process
                if tokio::time::timeout(self.grace, &mut run).await.is_err() {
                    tracing::warn!(
                        job = %ctx.job,
                        step = %step.display_name(),
                        "step did not stop within the shutdown grace period"
                    );
                }
                AttemptOutcome::Cancelled
            }
        }
    }
}

/// Timeout of the next attempt: the step timeout capped by the job deadline
fn attempt_limit(step_timeout: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (step_timeout, remaining) {
        (Some(step), Some(job)) => Some(step.min(job)),
        (step, job) => step.or(job),
    }
}
