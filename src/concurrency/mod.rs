// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Concurrency groups
//!
//! Every accepted run is registered under a group key resolved from the
//! definition's `concurrency.group` template. Within an unprotected group a
//! newer run supersedes the older one: the older run's [`CancelSignal`] is
//! raised and it is replaced as the group's holder. Protected groups (runs on
//! protected branches, or definitions with `cancel_in_progress: false`) admit
//! runs side by side.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::Mutex;

use crate::engine::{CancelSignal, RunId};
use crate::pipeline::PipelineDefinition;
use crate::trigger::RunContext;

/// A resolved concurrency group key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub key: String,
    /// Runs in a protected group never cancel each other
    pub protected: bool,
}

impl GroupKey {
    /// Resolve the key of a run of `definition`
    pub fn for_run(definition: &PipelineDefinition, ctx: &RunContext) -> Self {
        let (template, cancel_in_progress) = match &definition.concurrency {
            Some(config) => (config.group.as_deref(), config.cancel_in_progress),
            None => (None, true),
        };

        let mut key = resolve(template, ctx, &definition.name);
        key.protected |= !cancel_in_progress;
        key
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// Interpolate a group template against a run context
///
/// Supports `workflow`, `ref`, `event`, `actor` and `vars.NAME`; unknown
/// placeholders render empty. Without a template the key is
/// `<workflow>-<ref>`.
pub fn resolve(template: Option<&str>, ctx: &RunContext, workflow: &str) -> GroupKey {
    let key = match template {
        None => format!("{}-{}", workflow, ctx.git_ref),
        Some(template) => placeholder()
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                let value = match name {
                    "workflow" => Some(workflow.to_string()),
                    "ref" => Some(ctx.git_ref.clone()),
                    "event" => Some(ctx.event.to_string()),
                    "actor" => ctx.actor.clone(),
                    other => other
                        .strip_prefix("vars.")
                        .and_then(|var| ctx.variables.get(var).cloned()),
                };

                value.unwrap_or_else(|| {
                    tracing::debug!(placeholder = name, "unresolved concurrency placeholder");
                    String::new()
                })
            })
            .into_owned(),
    };

    GroupKey {
        key,
        protected: ctx.protected,
    }
}

/// A run currently holding a place in a group
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub cancel: CancelSignal,
}

/// Outcome of registering a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// False only if the run was already registered under this key
    pub admitted: bool,
    /// Runs that were superseded and signalled to cancel
    pub cancelled_prior: Vec<RunId>,
}

/// Registry of non-terminal runs per group key
#[derive(Debug, Default)]
pub struct ConcurrencyController {
    groups: Mutex<HashMap<String, Vec<RunHandle>>>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run, superseding prior holders of an unprotected key
    pub async fn register(&self, key: &GroupKey, handle: RunHandle) -> Admission {
        let mut groups = self.groups.lock().await;
        let holders = groups.entry(key.key.clone()).or_default();

        if holders.iter().any(|h| h.run_id == handle.run_id) {
            return Admission {
                admitted: false,
                cancelled_prior: Vec::new(),
            };
        }

        let mut cancelled_prior = Vec::new();
        if !key.protected {
            for prior in holders.drain(..) {
                tracing::info!(
                    group = %key.key,
                    superseded = prior.run_id,
                    by = handle.run_id,
                    "cancelling superseded run"
                );
                prior.cancel.cancel();
                cancelled_prior.push(prior.run_id);
            }
        }

        holders.push(handle);

        Admission {
            admitted: true,
            cancelled_prior,
        }
    }

    /// Remove a run that reached a terminal state
    pub async fn release(&self, key: &GroupKey, run_id: RunId) {
        let mut groups = self.groups.lock().await;
        if let Some(holders) = groups.get_mut(&key.key) {
            holders.retain(|h| h.run_id != run_id);
            if holders.is_empty() {
                groups.remove(&key.key);
            }
        }
    }

    /// Runs currently registered under a key
    pub async fn active(&self, key: &str) -> Vec<RunId> {
        self.groups
            .lock()
            .await
            .get(key)
            .map(|holders| holders.iter().map(|h| h.run_id).collect())
            .unwrap_or_default()
    }
}
