// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Run command - evaluate an event and execute the pipeline

use colored::Colorize;
use miette::Result;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use super::{load_config, report_definition_error, RunArgs};
use crate::engine::{Engine, JobReport, JobStatus, RunReport, Submission, Verdict};
use crate::history::RunHistory;
use crate::pipeline::Pipeline;
use crate::trigger::TriggerEvent;
use crate::utils::{print_error, print_info, print_success, print_warning};

/// Run the pipeline
pub async fn run(args: RunArgs, config_path: Option<&Path>, verbose: bool) -> Result<ExitCode> {
    let (mut config, cwd) = load_config(config_path)?;
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel_jobs = max_parallel.max(1);
    }

    let pipeline = match Pipeline::load(&args.definition) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) if e.is_definition_error() => return Ok(report_definition_error(e)),
        Err(e) => return Err(e.into()),
    };

    if verbose && !pipeline.warnings().is_empty() {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in pipeline.warnings() {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    let mut event = TriggerEvent::new(args.event, args.git_ref.clone()).with_draft(args.draft);
    if let Some(activity) = &args.activity {
        event = event.with_activity(activity);
    }
    if let Some(actor) = &args.actor {
        event = event.with_actor(actor);
    }
    for (key, value) in &args.vars {
        event = event.with_variable(key, value);
    }

    let history = RunHistory::new(&config.state_dir(&cwd));
    let first_id = if args.no_history {
        1
    } else {
        history.next_run_id().await?
    };
    let history_retention = config.history_retention;

    let engine = Engine::new(config, cwd)?.with_first_run_id(first_id);

    let active = match engine.submit(pipeline.clone(), &event).await? {
        Submission::Rejected(reason) => {
            if args.json {
                let json = serde_json::json!({ "triggered": false, "reason": reason });
                println!("{}", serde_json::to_string_pretty(&json).map_err(crate::JobflowError::from)?);
            } else {
                println!(
                    "{} {}",
                    "Not triggered:".yellow().bold(),
                    reason.to_string().yellow()
                );
            }
            return Ok(ExitCode::SUCCESS);
        }
        Submission::Started(active) => active,
    };

    if !args.json {
        println!(
            "{} {} #{} on {} ({} event, group {})",
            "Running".bold(),
            pipeline.name().bold(),
            active.id,
            args.git_ref.cyan(),
            args.event,
            active.group_key.to_string().dimmed()
        );
        println!();
    }

    let cancel = active.cancel_signal();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let report = active.wait().await;
    interrupt.abort();
    let report = report?;

    if !args.no_history {
        match history.save(&report).await {
            Ok(path) => tracing::debug!(path = %path.display(), "recorded run"),
            Err(e) => tracing::warn!("failed to record run: {}", e),
        }
        if let Err(e) = history.prune(history_retention).await {
            tracing::warn!("failed to prune run history: {}", e);
        }
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).map_err(crate::JobflowError::from)?
        );
    } else {
        print_report(&report, verbose);
    }

    Ok(ExitCode::from(report.verdict.exit_code()))
}

/// Human-readable run summary
pub fn print_report(report: &RunReport, verbose: bool) {
    for job in &report.jobs {
        print_job(job, verbose);
    }

    println!();
    let counts = format!(
        "{} succeeded, {} failed, {} cancelled, {} skipped in {:.2}s",
        report.counts.succeeded,
        report.counts.failed,
        report.counts.cancelled,
        report.counts.skipped,
        report.duration_ms as f64 / 1000.0
    );

    match report.verdict {
        Verdict::Succeeded => println!("{} {}", "Pipeline succeeded:".green().bold(), counts),
        Verdict::Failed => println!("{} {}", "Pipeline failed:".red().bold(), counts),
        Verdict::Cancelled => println!("{} {}", "Pipeline cancelled:".yellow().bold(), counts),
    }
}

fn print_job(job: &JobReport, verbose: bool) {
    let timing = format!("({:.2}s)", job.duration_ms as f64 / 1000.0);

    match job.status {
        JobStatus::Succeeded => print_success(&format!("{} {}", job.name, timing.dimmed())),
        JobStatus::Failed => {
            let mut line = job.name.clone();
            if let Some(step) = &job.failing_step {
                line.push_str(&format!(" failed at step '{}'", step));
            }
            if job.continue_on_error {
                line.push_str(" (continue-on-error)");
                print_warning(&line);
            } else {
                print_error(&line);
            }
            if let Some(error) = &job.error {
                println!("      {}", error.dimmed());
            }
        }
        JobStatus::Cancelled => print_warning(&format!("{} cancelled", job.name)),
        JobStatus::Skipped => {
            let reason = job
                .skip_reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default();
            print_info(&format!("{} skipped: {}", job.name, reason));
        }
        other => print_info(&format!("{} {}", job.name, other)),
    }

    if verbose {
        for step in &job.steps {
            let attempts = if step.attempts > 1 {
                format!(" after {} attempts", step.attempts)
            } else {
                String::new()
            };
            println!(
                "      {} {:?}{}",
                step.name.dimmed(),
                step.status,
                attempts
            );
        }
    }
}
