// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! # jobflow - CI pipeline orchestration
//!
//! `jobflow` interprets a job graph together with its trigger, concurrency
//! and dependency semantics, and drives every job to a terminal result.
//!
//! ## Features
//!
//! - **Triggers** - event kind, branch globs, activity types and draft filtering
//! - **Concurrency groups** - newer runs supersede older ones outside protected branches
//! - **Conditions** - `if` expressions over run context and needed job results
//! - **Artifacts** - run-scoped handoff, visible only to dependent jobs
//! - **Retries and timeouts** - per step, with cancellation grace periods
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a definition
//! jobflow validate ci.yaml
//!
//! # Run it for a push to main
//! jobflow run ci.yaml --event push --ref main
//!
//! # Look at past runs
//! jobflow history list
//! ```

pub mod artifacts;
pub mod cli;
pub mod concurrency;
pub mod condition;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod history;
pub mod pipeline;
pub mod trigger;
pub mod utils;

// Re-export commonly used types
pub use engine::{Engine, RunReport, Submission, Verdict};
pub use errors::{JobflowError, JobflowResult};
pub use pipeline::{Pipeline, PipelineDefinition};
pub use trigger::{EventKind, TriggerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
