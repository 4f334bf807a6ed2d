// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! History command - inspect recorded runs

use colored::Colorize;
use miette::Result;
use std::path::Path;
use std::process::ExitCode;

use super::{load_config, HistoryAction, OutputFormat};
use crate::engine::Verdict;
use crate::errors::JobflowError;
use crate::history::RunHistory;
use crate::pipeline::duration::format_duration;

/// Run history command
pub async fn run(action: HistoryAction, config_path: Option<&Path>, verbose: bool) -> Result<ExitCode> {
    let (config, cwd) = load_config(config_path)?;
    let history = RunHistory::new(&config.state_dir(&cwd));

    match action {
        HistoryAction::List { format } => {
            let runs = history.list().await?;

            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&runs).map_err(JobflowError::from)?);
                return Ok(ExitCode::SUCCESS);
            }

            if runs.is_empty() {
                println!("{}", "No recorded runs.".dimmed());
                return Ok(ExitCode::SUCCESS);
            }

            println!("{}", "Recorded runs".bold());
            println!("{}", "═".repeat(40));
            for run in &runs {
                let verdict = match run.verdict {
                    Verdict::Succeeded => run.verdict.to_string().green(),
                    Verdict::Failed => run.verdict.to_string().red(),
                    Verdict::Cancelled => run.verdict.to_string().yellow(),
                };
                println!(
                    "  #{:<5} {:<20} {:<24} {:<10} {:.2}s",
                    run.run_id,
                    run.pipeline,
                    run.git_ref,
                    verdict,
                    run.duration_ms as f64 / 1000.0
                );
            }
        }

        HistoryAction::Show { id, format } => {
            let report = history.load(id).await?;

            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&report).map_err(JobflowError::from)?);
            } else {
                println!(
                    "{} #{} {} on {} ({} event)",
                    "Run".bold(),
                    report.run_id,
                    report.pipeline.bold(),
                    report.context.git_ref.cyan(),
                    report.context.event
                );
                println!();
                super::run::print_report(&report, verbose);
            }
        }

        HistoryAction::Prune => {
            let removed = history.prune(config.history_retention).await?;
            println!(
                "{} Removed {} run(s) older than {}",
                "✓".green(),
                removed,
                format_duration(config.history_retention)
            );
        }

        HistoryAction::Clear => {
            history.clear().await?;
            println!("{} Run history cleared", "✓".green());
        }

        HistoryAction::Stats => {
            let stats = history.stats().await?;
            println!("{}", "Run history".bold());
            println!("  Location: {}", history.dir().display());
            println!("  Runs:     {}", stats.runs);
            println!("  Size:     {}", stats.formatted_size());
        }
    }

    Ok(ExitCode::SUCCESS)
}
