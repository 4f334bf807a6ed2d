// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Engine behaviour with scripted step runners

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use jobflow::config::{ArtifactBackendKind, EngineConfig};
use jobflow::engine::{Engine, JobStatus, SkipReason, StepStatus, Submission, Verdict};
use jobflow::executors::{StepContext, StepOutput, StepRunner};
use jobflow::pipeline::{Pipeline, PipelineDefinition, Step};
use jobflow::trigger::{EventKind, TriggerEvent};
use jobflow::JobflowResult;

/// What a job's steps do when run
#[derive(Clone, Copy)]
enum Script {
    Succeed(u64),
    Fail(u64),
}

/// Runs steps according to a per-job script and records what happened
#[derive(Default)]
struct Scripted {
    scripts: HashMap<String, Script>,
    log: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Scripted {
    fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .iter()
                .map(|(job, script)| (job.to_string(), *script))
                .collect(),
            ..Self::default()
        })
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("'{}' not in log {:?}", entry, self.log()))
    }

    fn ran(&self, job: &str) -> bool {
        self.log().contains(&format!("start {}", job))
    }
}

#[async_trait]
impl StepRunner for Scripted {
    async fn run(&self, _step: &Step, ctx: &StepContext) -> JobflowResult<StepOutput> {
        let script = self
            .scripts
            .get(&ctx.job)
            .copied()
            .unwrap_or(Script::Succeed(0));

        self.log.lock().unwrap().push(format!("start {}", ctx.job));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let millis = match script {
            Script::Succeed(ms) | Script::Fail(ms) => ms,
        };
        // Cancellation is left to the engine's grace period
        tokio::time::sleep(Duration::from_millis(millis)).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("end {}", ctx.job));

        Ok(match script {
            Script::Succeed(_) => StepOutput::success("ok"),
            Script::Fail(_) => StepOutput::failure(1, "scripted failure"),
        })
    }
}

fn pipeline(yaml: &str) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(PipelineDefinition::from_yaml(yaml).unwrap()).unwrap())
}

fn engine(temp: &TempDir, runner: Arc<Scripted>, max_parallel: usize) -> Engine {
    let config = EngineConfig {
        max_parallel_jobs: max_parallel,
        shutdown_grace: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    Engine::new(config, temp.path().to_path_buf())
        .unwrap()
        .with_runner(runner)
}

fn push(git_ref: &str) -> TriggerEvent {
    TriggerEvent::new(EventKind::Push, git_ref)
}

const BUILD_LINT_TEST: &str = r#"
name: ci
jobs:
  - name: build
    steps: [{ run: make }]
  - name: lint
    needs: [build]
    steps: [{ run: make lint }]
  - name: test
    needs: [build]
    steps: [{ run: make test }]
"#;

#[tokio::test]
async fn job_waits_for_every_need() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[
        ("a", Script::Succeed(40)),
        ("b", Script::Succeed(120)),
        ("c", Script::Succeed(0)),
    ]);
    let pipeline = pipeline(
        r#"
name: fan-in
jobs:
  - name: a
    steps: [{ run: a }]
  - name: b
    steps: [{ run: b }]
  - name: c
    needs: [a, b]
    steps: [{ run: c }]
"#,
    );

    let report = engine(&temp, runner.clone(), 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.verdict, Verdict::Succeeded);
    let start_c = runner.position("start c");
    assert!(start_c > runner.position("end a"));
    assert!(start_c > runner.position("end b"));
}

#[tokio::test]
async fn failed_build_skips_lint_and_test() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("build", Script::Fail(0))]);

    let report = engine(&temp, runner.clone(), 4)
        .run(pipeline(BUILD_LINT_TEST), &push("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.counts.skipped, 2);

    for name in ["lint", "test"] {
        let job = report.job(name).unwrap();
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(
            job.skip_reason,
            Some(SkipReason::DependencyFailed { job: "build".into() })
        );
        assert!(!runner.ran(name));
    }
    assert_eq!(report.job("build").unwrap().failing_step.as_deref(), Some("make"));
}

#[tokio::test]
async fn skip_propagates_root_failure_transitively() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("build", Script::Fail(0))]);
    let pipeline = pipeline(
        r#"
name: chain
jobs:
  - name: build
    steps: [{ run: make }]
  - name: test
    needs: [build]
    steps: [{ run: make test }]
  - name: deploy
    needs: [test]
    steps: [{ run: make deploy }]
"#,
    );

    let report = engine(&temp, runner, 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        report.job("deploy").unwrap().skip_reason,
        Some(SkipReason::DependencyFailed { job: "build".into() })
    );
}

#[tokio::test]
async fn continue_on_error_job_does_not_block() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("coverage", Script::Fail(0))]);
    let pipeline = pipeline(
        r#"
name: soft
jobs:
  - name: coverage
    continue_on_error: true
    steps: [{ run: coverage }]
  - name: publish
    needs: [coverage]
    steps: [{ run: publish }]
"#,
    );

    let report = engine(&temp, runner.clone(), 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    // Dependents still run, but the failure counts against the run
    assert_eq!(report.verdict, Verdict::Failed);
    assert_eq!(report.job("coverage").unwrap().status, JobStatus::Failed);
    assert_eq!(report.job("publish").unwrap().status, JobStatus::Succeeded);
    assert!(runner.ran("publish"));
}

#[tokio::test]
async fn false_condition_skips_without_blocking_dependents() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[]);
    let pipeline = pipeline(
        r#"
name: conditional
jobs:
  - name: docs
    if: "event == 'pull_request'"
    steps: [{ run: docs }]
  - name: release
    needs: [docs]
    if: "needs.docs.result == 'skipped'"
    steps: [{ run: release }]
"#,
    );

    let report = engine(&temp, runner.clone(), 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    let docs = report.job("docs").unwrap();
    assert_eq!(docs.status, JobStatus::Skipped);
    assert_eq!(docs.skip_reason, Some(SkipReason::Condition));
    assert!(!runner.ran("docs"));
    assert_eq!(report.job("release").unwrap().status, JobStatus::Succeeded);
    assert_eq!(report.verdict, Verdict::Succeeded);
}

#[tokio::test]
async fn parallelism_is_bounded() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[
        ("one", Script::Succeed(60)),
        ("two", Script::Succeed(60)),
        ("three", Script::Succeed(60)),
        ("four", Script::Succeed(60)),
    ]);
    let pipeline = pipeline(
        r#"
name: wide
jobs:
  - { name: one, steps: [{ run: x }] }
  - { name: two, steps: [{ run: x }] }
  - { name: three, steps: [{ run: x }] }
  - { name: four, steps: [{ run: x }] }
"#,
    );

    let report = engine(&temp, runner.clone(), 2)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.counts.succeeded, 4);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelled_run_cancels_unstarted_jobs() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("build", Script::Succeed(10_000))]);
    let engine = engine(&temp, runner.clone(), 4);

    let Submission::Started(active) = engine
        .submit(pipeline(BUILD_LINT_TEST), &push("main"))
        .await
        .unwrap()
    else {
        panic!("push to main should trigger");
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    active.cancel();
    let report = active.wait().await.unwrap();

    assert_eq!(report.verdict, Verdict::Cancelled);
    assert_eq!(report.verdict.exit_code(), 2);
    assert_eq!(report.job("build").unwrap().status, JobStatus::Cancelled);
    assert_eq!(report.job("lint").unwrap().status, JobStatus::Cancelled);
    assert_eq!(report.job("test").unwrap().status, JobStatus::Cancelled);
    assert!(!runner.ran("lint"));
}

#[tokio::test]
async fn newer_run_supersedes_older_on_unprotected_ref() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("build", Script::Succeed(300))]);
    let engine = engine(&temp, runner, 4);
    let pipeline = pipeline(BUILD_LINT_TEST);

    let Submission::Started(first) = engine.submit(pipeline.clone(), &push("feature/x")).await.unwrap()
    else {
        panic!("first push should trigger");
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let Submission::Started(second) = engine.submit(pipeline, &push("feature/x")).await.unwrap()
    else {
        panic!("second push should trigger");
    };

    assert_eq!(second.cancelled_prior, vec![first.id]);
    assert_eq!(
        engine.concurrency().active(&second.group_key.key).await,
        vec![second.id]
    );

    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    assert_eq!(first.verdict, Verdict::Cancelled);
    assert_eq!(second.verdict, Verdict::Succeeded);
}

#[tokio::test]
async fn protected_ref_runs_side_by_side() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("build", Script::Succeed(150))]);
    let engine = engine(&temp, runner, 4);
    let pipeline = pipeline(BUILD_LINT_TEST);

    let Submission::Started(first) = engine.submit(pipeline.clone(), &push("main")).await.unwrap()
    else {
        panic!("first push should trigger");
    };
    let Submission::Started(second) = engine.submit(pipeline, &push("main")).await.unwrap()
    else {
        panic!("second push should trigger");
    };

    assert!(second.group_key.protected);
    assert!(second.cancelled_prior.is_empty());
    assert_eq!(
        engine.concurrency().active(&second.group_key.key).await,
        vec![first.id, second.id]
    );

    assert_eq!(first.wait().await.unwrap().verdict, Verdict::Succeeded);
    assert_eq!(second.wait().await.unwrap().verdict, Verdict::Succeeded);
}

#[tokio::test]
async fn artifacts_flow_only_to_dependents() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::new(EngineConfig::default(), temp.path().to_path_buf()).unwrap();
    let pipeline = pipeline(
        r#"
name: handoff
jobs:
  - name: build
    steps:
      - uses: upload-artifact
        with: { name: bin, content: "hello" }
  - name: test
    needs: [build]
    steps:
      - uses: download-artifact
        with: { name: bin, path: out/bin.txt }
  - name: audit
    steps:
      - uses: download-artifact
        with: { name: bin }
"#,
    );

    let report = engine.run(pipeline, &push("main")).await.unwrap().unwrap();

    assert_eq!(report.job("test").unwrap().status, JobStatus::Succeeded);
    assert_eq!(
        std::fs::read_to_string(temp.path().join("out/bin.txt")).unwrap(),
        "hello"
    );

    let audit = report.job("audit").unwrap();
    assert_eq!(audit.status, JobStatus::Failed);
    assert!(audit.error.as_deref().unwrap().contains("not found"));
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn job_timeout_fails_the_job() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("slow", Script::Succeed(5000))]);
    let pipeline = pipeline(
        r#"
name: deadline
jobs:
  - name: slow
    timeout: 200ms
    steps: [{ run: make }]
  - name: after
    needs: [slow]
    steps: [{ run: make }]
"#,
    );

    let report = engine(&temp, runner, 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    let slow = report.job("slow").unwrap();
    assert_eq!(slow.status, JobStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timeout"));
    assert!(slow.duration_ms < 2000);
    assert_eq!(report.job("after").unwrap().status, JobStatus::Skipped);
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn job_timeout_applies_to_continue_on_error_step() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("slow", Script::Succeed(5000))]);
    let pipeline = pipeline(
        r#"
name: deadline
jobs:
  - name: slow
    timeout: 200ms
    steps:
      - name: soak
        run: make soak
        continue_on_error: true
"#,
    );

    let report = engine(&temp, runner, 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    let slow = report.job("slow").unwrap();
    assert_eq!(slow.status, JobStatus::Failed);
    assert_eq!(slow.failing_step.as_deref(), Some("soak"));
    assert!(slow.error.as_deref().unwrap().contains("timeout"));
    assert_eq!(report.verdict, Verdict::Failed);
}

#[tokio::test]
async fn continue_on_error_step_failure_keeps_job_running() {
    let temp = TempDir::new().unwrap();
    let runner = Scripted::new(&[("lint", Script::Fail(0))]);
    let pipeline = pipeline(
        r#"
name: soft-step
jobs:
  - name: lint
    steps:
      - run: clippy
        continue_on_error: true
      - run: fmt
        continue_on_error: true
  - name: test
    needs: [lint]
    steps: [{ run: make test }]
"#,
    );

    let report = engine(&temp, runner.clone(), 4)
        .run(pipeline, &push("main"))
        .await
        .unwrap()
        .unwrap();

    let lint = report.job("lint").unwrap();
    assert_eq!(lint.status, JobStatus::Succeeded);
    assert_eq!(lint.steps.len(), 2);
    assert!(lint.steps.iter().all(|s| s.status == StepStatus::Failed));
    assert!(runner.ran("test"));
    assert_eq!(report.verdict, Verdict::Succeeded);
}

#[tokio::test]
async fn filesystem_artifacts_do_not_collide_across_engines() {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig {
        artifact_backend: ArtifactBackendKind::Filesystem,
        ..EngineConfig::default()
    };
    let pipeline = pipeline(
        r#"
name: upload
jobs:
  - name: build
    steps:
      - uses: upload-artifact
        with: { name: bin, content: "hello" }
"#,
    );

    let mut ids = Vec::new();
    for _ in 0..2 {
        // Each engine stands in for a separate CLI invocation
        let engine = Engine::new(config.clone(), temp.path().to_path_buf())
            .unwrap()
            .with_first_run_id(1);
        let report = engine
            .run(pipeline.clone(), &push("main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.verdict, Verdict::Succeeded, "{:?}", report.job("build"));
        ids.push(report.run_id);
    }

    assert_eq!(ids, vec![1, 2]);
}

#[cfg(unix)]
#[tokio::test]
async fn timed_out_step_leaves_no_processes_behind() {
    let temp = TempDir::new().unwrap();
    let engine = Engine::new(EngineConfig::default(), temp.path().to_path_buf()).unwrap();
    let pipeline = pipeline(
        r#"
name: stray
jobs:
  - name: build
    steps:
      - run: "(sleep 1; touch marker) & wait"
        timeout: 200ms
"#,
    );

    let report = engine.run(pipeline, &push("main")).await.unwrap().unwrap();
    assert_eq!(report.verdict, Verdict::Failed);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!temp.path().join("marker").exists());
}
