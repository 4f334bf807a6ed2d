// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Pipeline execution engine
//!
//! [`Engine`] ties the pieces together: an event is checked against the
//! definition's triggers, the accepted run is registered with its concurrency
//! group, and the [`Scheduler`] drives its jobs. When the scheduler returns,
//! the group slot is released, the artifact retention clock starts and the
//! [`ResultAggregator`] turns the run into a [`RunReport`].

mod report;
mod retry;
mod scheduler;
mod state;

pub use report::{JobReport, ResultAggregator, RunReport, StatusCounts, Verdict};
pub use retry::{AttemptFailure, RetryExecutor, RetryState};
pub use scheduler::Scheduler;
pub use state::{
    CancelSignal, JobExecution, JobStatus, PipelineRun, RunId, SkipReason, StepResult, StepStatus,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::artifacts::{ArtifactStore, FilesystemBackend};
use crate::concurrency::{ConcurrencyController, GroupKey, RunHandle};
use crate::config::{ArtifactBackendKind, EngineConfig};
use crate::errors::{JobflowError, JobflowResult};
use crate::executors::{DefaultRunner, StepRunner};
use crate::pipeline::Pipeline;
use crate::trigger::{RejectReason, TriggerDecision, TriggerEvaluator, TriggerEvent};

/// Long-lived orchestrator shared by every run it starts
pub struct Engine {
    config: EngineConfig,
    workspace: PathBuf,
    concurrency: Arc<ConcurrencyController>,
    artifacts: Arc<ArtifactStore>,
    runner: Arc<dyn StepRunner>,
    next_run: AtomicU64,
}

/// Result of submitting an event
pub enum Submission {
    /// The event did not match the definition's triggers
    Rejected(RejectReason),
    Started(ActiveRun),
}

/// Handle to a run in progress
pub struct ActiveRun {
    pub id: RunId,
    pub group_key: GroupKey,
    /// Older runs of the same group this run superseded
    pub cancelled_prior: Vec<RunId>,
    cancel: CancelSignal,
    handle: JoinHandle<RunReport>,
}

impl ActiveRun {
    /// Ask the run to stop; jobs not yet started end Cancelled
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Signal shared with the run, for wiring to Ctrl-C and similar
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> JobflowResult<RunReport> {
        self.handle.await.map_err(|e| JobflowError::ExecutionFailed {
            message: format!("run {} did not complete: {}", self.id, e),
            help: None,
        })
    }
}

impl Engine {
    /// Build an engine from configuration, running steps in `workspace`
    pub fn new(config: EngineConfig, workspace: PathBuf) -> JobflowResult<Self> {
        let artifacts = match config.artifact_backend {
            ArtifactBackendKind::Memory => ArtifactStore::in_memory(config.artifact_retention),
            ArtifactBackendKind::Filesystem => {
                let root = config.state_dir(&workspace).join("artifacts");
                ArtifactStore::new(
                    Arc::new(FilesystemBackend::new(root)?),
                    config.artifact_retention,
                )
            }
        };

        Ok(Self {
            config,
            workspace,
            concurrency: Arc::new(ConcurrencyController::new()),
            artifacts: Arc::new(artifacts),
            runner: Arc::new(DefaultRunner::new()),
            next_run: AtomicU64::new(1),
        })
    }

    /// Replace the step runner
    pub fn with_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Number run ids from `first` onwards
    ///
    /// Ids that already hold stored artifacts, for example from an earlier
    /// process sharing the state directory, are skipped.
    pub fn with_first_run_id(self, first: RunId) -> Self {
        self.next_run.store(first, Ordering::SeqCst);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn concurrency(&self) -> &ConcurrencyController {
        &self.concurrency
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Evaluate `event` against `pipeline` and start a run if it is accepted
    pub async fn submit(
        &self,
        pipeline: Arc<Pipeline>,
        event: &TriggerEvent,
    ) -> JobflowResult<Submission> {
        let context = match TriggerEvaluator::evaluate(pipeline.definition(), event) {
            TriggerDecision::Accept(context) => context,
            TriggerDecision::Reject(reason) => {
                tracing::info!(pipeline = pipeline.name(), %reason, "trigger rejected");
                return Ok(Submission::Rejected(reason));
            }
        };

        let id = self.allocate_run_id().await?;
        let group_key = GroupKey::for_run(pipeline.definition(), &context);
        let cancel = CancelSignal::new();

        let admission = self
            .concurrency
            .register(
                &group_key,
                RunHandle {
                    run_id: id,
                    cancel: cancel.clone(),
                },
            )
            .await;
        if !admission.admitted {
            return Err(JobflowError::ExecutionFailed {
                message: format!("run {} is already registered under '{}'", id, group_key),
                help: None,
            });
        }

        tracing::info!(
            run = id,
            pipeline = pipeline.name(),
            group = %group_key,
            git_ref = %context.git_ref,
            "run accepted"
        );

        let scheduler = Scheduler::new(
            pipeline.clone(),
            RetryExecutor::new(self.runner.clone(), self.config.shutdown_grace),
            self.artifacts.clone(),
            self.config.max_parallel_jobs,
            self.workspace.clone(),
        );
        let concurrency = self.concurrency.clone();
        let artifacts = self.artifacts.clone();
        let key = group_key.clone();
        let signal = cancel.clone();
        let span = tracing::info_span!("run", id, pipeline = pipeline.name());

        let handle = tokio::spawn(
            async move {
                let run = scheduler.execute(id, key.key.clone(), context, signal).await;

                concurrency.release(&key, id).await;
                if let Err(e) = artifacts.complete_run(id).await {
                    tracing::warn!("failed to record artifact completion: {}", e);
                }
                if let Err(e) = artifacts.reclaim_expired().await {
                    tracing::warn!("failed to reclaim expired artifacts: {}", e);
                }

                let report = ResultAggregator::aggregate(&run);
                tracing::info!(verdict = %report.verdict, duration_ms = report.duration_ms, "run finished");
                report
            }
            .instrument(span),
        );

        Ok(Submission::Started(ActiveRun {
            id,
            group_key,
            cancelled_prior: admission.cancelled_prior,
            cancel,
            handle,
        }))
    }

    /// Next run id not yet used by this store
    async fn allocate_run_id(&self) -> JobflowResult<RunId> {
        loop {
            let id = self.next_run.fetch_add(1, Ordering::SeqCst);
            if self.artifacts.claim_run(id).await? {
                return Ok(id);
            }
            tracing::debug!(run = id, "run id already in use, skipping");
        }
    }

    /// Submit and wait; the inner `Err` carries a trigger rejection
    pub async fn run(
        &self,
        pipeline: Arc<Pipeline>,
        event: &TriggerEvent,
    ) -> JobflowResult<Result<RunReport, RejectReason>> {
        match self.submit(pipeline, event).await? {
            Submission::Rejected(reason) => Ok(Err(reason)),
            Submission::Started(run) => run.wait().await.map(Ok),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineDefinition;
    use crate::trigger::EventKind;
    use tempfile::TempDir;

    fn pipeline(yaml: &str) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(PipelineDefinition::from_yaml(yaml).unwrap()).unwrap())
    }

    fn engine(temp: &TempDir) -> Engine {
        Engine::new(EngineConfig::default(), temp.path().to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn test_rejected_event_starts_nothing() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(
            r#"
name: ci
on:
  push:
    branches: [main]
jobs:
  - name: build
    steps: [{ run: "true" }]
"#,
        );

        let result = engine(&temp)
            .run(pipeline, &TriggerEvent::new(EventKind::Push, "feature/x"))
            .await
            .unwrap();

        assert!(matches!(result, Err(RejectReason::BranchFiltered { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_releases_group() {
        let temp = TempDir::new().unwrap();
        let engine = engine(&temp);
        let pipeline = pipeline(
            r#"
name: ci
jobs:
  - name: build
    steps: [{ run: "true" }]
"#,
        );

        let report = engine
            .run(pipeline, &TriggerEvent::new(EventKind::Push, "main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.verdict, Verdict::Succeeded);
        assert_eq!(report.group_key, "ci-main");
        assert!(engine.concurrency().active("ci-main").await.is_empty());
    }
}
