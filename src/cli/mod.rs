// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for jobflow.

pub mod graph;
pub mod history;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::config::EngineConfig;
use crate::errors::JobflowError;
use crate::trigger::EventKind;

/// Exit code for definitions that cannot be loaded or validated
pub const EXIT_DEFINITION_ERROR: u8 = 3;

/// CI pipeline orchestrator
#[derive(Parser, Debug)]
#[clap(
    name = "jobflow",
    version,
    about = "Run CI job graphs with triggers, concurrency groups and artifact handoff",
    long_about = None,
    after_help = "Examples:\n\
        jobflow run ci.yaml --event push --ref main      Run the pipeline for a push\n\
        jobflow validate ci.yaml                         Check a definition\n\
        jobflow graph ci.yaml --format mermaid           Show the job graph\n\
        jobflow history list                             List recorded runs\n\n\
        See 'jobflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Engine config file (defaults to ./jobflow.toml when present)
    #[clap(long, global = true, value_name = "FILE", env = "JOBFLOW_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate an event and run the pipeline if it triggers
    Run(RunArgs),

    /// Validate a pipeline definition
    Validate {
        /// Definition file to validate
        #[clap(default_value = "jobflow.yaml")]
        definition: PathBuf,
    },

    /// Show the job graph
    Graph {
        /// Definition file
        #[clap(default_value = "jobflow.yaml")]
        definition: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Inspect recorded runs
    History {
        #[clap(subcommand)]
        action: HistoryAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Definition file
    #[clap(default_value = "jobflow.yaml")]
    pub definition: PathBuf,

    /// Event kind (push, pull_request, pull_request_target, schedule, manual, merge_group)
    #[clap(short, long, default_value = "push")]
    pub event: EventKind,

    /// Target ref of the event
    #[clap(short = 'r', long = "ref", value_name = "REF", default_value = "main")]
    pub git_ref: String,

    /// The pull request is a draft
    #[clap(long)]
    pub draft: bool,

    /// Activity type, e.g. opened or synchronize
    #[clap(long)]
    pub activity: Option<String>,

    /// Who triggered the event
    #[clap(long, env = "JOBFLOW_ACTOR")]
    pub actor: Option<String>,

    /// Variable override (repeatable)
    #[clap(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,

    /// Maximum jobs running at once (overrides config)
    #[clap(long, env = "JOBFLOW_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Print the run report as JSON
    #[clap(long)]
    pub json: bool,

    /// Do not record the run in history
    #[clap(long)]
    pub no_history: bool,
}

/// Run history actions
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryAction {
    /// List recorded runs
    List {
        /// Output format
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show one run's report
    Show {
        /// Run id
        id: u64,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Remove runs older than the retention window
    Prune,

    /// Remove every recorded run
    Clear,

    /// Show history statistics
    Stats,
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Load the engine config for a command
pub(crate) fn load_config(explicit: Option<&Path>) -> miette::Result<(EngineConfig, PathBuf)> {
    let cwd = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;
    let config = EngineConfig::load(explicit, &cwd)?;
    Ok((config, cwd))
}

/// Print a definition error with its recovery hint and return exit code 3
pub(crate) fn report_definition_error(error: JobflowError) -> ExitCode {
    let recovery = error.recovery();
    eprintln!("{:?}", miette::Report::new(error));
    if let Some(suggestion) = recovery {
        eprintln!("{}", suggestion);
    }
    ExitCode::from(EXIT_DEFINITION_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::parse_from([
            "jobflow",
            "run",
            "ci.yaml",
            "--event",
            "pull_request",
            "--ref",
            "main",
            "--draft",
            "--var",
            "target=linux",
        ]);

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.event, EventKind::PullRequest);
        assert!(args.draft);
        assert_eq!(args.vars, vec![("target".to_string(), "linux".to_string())]);
    }

    #[test]
    fn test_key_value_parsing() {
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }
}
