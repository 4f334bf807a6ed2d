// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! jobflow - CI pipeline orchestrator
//!
//! Exit codes: 0 succeeded (or not triggered), 1 failed, 2 cancelled,
//! 3 invalid definition.

use clap::Parser;
use miette::Result;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobflow::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "jobflow=debug" } else { "jobflow=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    let config = cli.config.as_deref();

    // Dispatch to command handlers
    match cli.command {
        Commands::Run(args) => jobflow::cli::run::run(args, config, cli.verbose).await,
        Commands::Validate { definition } => {
            jobflow::cli::validate::run(definition, cli.verbose).await
        }
        Commands::Graph { definition, format } => {
            jobflow::cli::graph::run(definition, format, cli.verbose).await
        }
        Commands::History { action } => {
            jobflow::cli::history::run(action, config, cli.verbose).await
        }
    }
}
