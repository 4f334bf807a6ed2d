// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Trigger evaluation
//!
//! Decides whether a repository event starts a pipeline run. The decision is
//! a pure function of the definition's `on` section and the event.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::pipeline::PipelineDefinition;

/// Kinds of events that can start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    PullRequestTarget,
    Schedule,
    #[serde(alias = "workflow_dispatch")]
    Manual,
    MergeGroup,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::Push,
        Self::PullRequest,
        Self::PullRequestTarget,
        Self::Schedule,
        Self::Manual,
        Self::MergeGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::PullRequestTarget => "pull_request_target",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::MergeGroup => "merge_group",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "workflow_dispatch" => Ok(Self::Manual),
            other => Self::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| format!("Unknown event kind: {}", s)),
        }
    }
}

/// Per-event-kind filter from the definition's `on` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Branch patterns the target ref must match (empty: any branch)
    #[serde(default)]
    pub branches: Vec<String>,

    /// Branch patterns that exclude the target ref
    #[serde(default)]
    pub branches_ignore: Vec<String>,

    /// Accepted activity sub-types (empty: any activity)
    #[serde(default)]
    pub types: Vec<String>,

    /// Whether draft pull requests start runs
    #[serde(default = "default_true")]
    pub drafts: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            branches_ignore: Vec::new(),
            types: Vec::new(),
            drafts: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The definition's `on` section
///
/// Either a plain list of event kinds or a map from kind to filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Triggers {
    Kinds(Vec<EventKind>),
    Filters(BTreeMap<EventKind, Option<EventFilter>>),
}

impl Default for Triggers {
    fn default() -> Self {
        Self::Kinds(vec![EventKind::Push, EventKind::Manual])
    }
}

impl Triggers {
    /// Filter configured for an event kind, if the kind is configured at all
    pub fn filter_for(&self, kind: EventKind) -> Option<EventFilter> {
        match self {
            Self::Kinds(kinds) => kinds.contains(&kind).then(EventFilter::default),
            Self::Filters(filters) => filters
                .get(&kind)
                .map(|filter| filter.clone().unwrap_or_default()),
        }
    }

    /// All branch patterns appearing in filters
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            Self::Kinds(_) => Vec::new(),
            Self::Filters(filters) => filters
                .values()
                .flatten()
                .flat_map(|f| f.branches.iter().chain(f.branches_ignore.iter()))
                .map(String::as_str)
                .collect(),
        }
    }
}

/// An incoming repository event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    /// Target ref (branch the push landed on, or the PR's base branch)
    pub git_ref: String,
    #[serde(default)]
    pub draft: bool,
    /// Activity sub-type, e.g. `opened` or `synchronize` for pull requests
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Variables that override the definition's `vars`
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// Opaque source metadata (sha, repository, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            draft: false,
            activity: None,
            actor: None,
            variables: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_draft(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// Run-scoped context created when a trigger is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub event: EventKind,
    pub git_ref: String,
    pub draft: bool,
    /// Whether the ref is one of the definition's protected branches
    pub protected: bool,
    pub actor: Option<String>,
    pub activity: Option<String>,
    pub variables: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// Why an event did not start a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    EventNotConfigured { kind: EventKind },
    BranchFiltered { git_ref: String },
    ActivityFiltered {
        activity: Option<String>,
        allowed: Vec<String>,
    },
    DraftExcluded,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventNotConfigured { kind } => {
                write!(f, "pipeline is not triggered by '{}' events", kind)
            }
            Self::BranchFiltered { git_ref } => {
                write!(f, "ref '{}' does not match the branch filters", git_ref)
            }
            Self::ActivityFiltered { activity, allowed } => write!(
                f,
                "activity '{}' is not one of: {}",
                activity.as_deref().unwrap_or("<none>"),
                allowed.join(", ")
            ),
            Self::DraftExcluded => write!(f, "draft pull requests do not start runs"),
        }
    }
}

/// Outcome of trigger evaluation
#[derive(Debug, Clone)]
pub enum TriggerDecision {
    Accept(RunContext),
    Reject(RejectReason),
}

impl TriggerDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Evaluates trigger predicates
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    /// Decide whether `event` starts a run of `definition`
    pub fn evaluate(definition: &PipelineDefinition, event: &TriggerEvent) -> TriggerDecision {
        let Some(filter) = definition.triggers.filter_for(event.kind) else {
            return TriggerDecision::Reject(RejectReason::EventNotConfigured { kind: event.kind });
        };

        let git_ref = normalize_ref(&event.git_ref);

        if !filter.branches.is_empty() && !any_match(&filter.branches, git_ref) {
            return TriggerDecision::Reject(RejectReason::BranchFiltered {
                git_ref: git_ref.to_string(),
            });
        }

        if any_match(&filter.branches_ignore, git_ref) {
            return TriggerDecision::Reject(RejectReason::BranchFiltered {
                git_ref: git_ref.to_string(),
            });
        }

        if !filter.types.is_empty() {
            let declared = event
                .activity
                .as_ref()
                .is_some_and(|activity| filter.types.contains(activity));
            if !declared {
                return TriggerDecision::Reject(RejectReason::ActivityFiltered {
                    activity: event.activity.clone(),
                    allowed: filter.types.clone(),
                });
            }
        }

        if event.draft && !filter.drafts {
            return TriggerDecision::Reject(RejectReason::DraftExcluded);
        }

        let mut variables = definition.vars.clone();
        variables.extend(event.variables.clone());

        TriggerDecision::Accept(RunContext {
            event: event.kind,
            git_ref: git_ref.to_string(),
            draft: event.draft,
            protected: any_match(&definition.protected_branches, git_ref),
            actor: event.actor.clone(),
            activity: event.activity.clone(),
            variables,
            metadata: event.metadata.clone(),
        })
    }
}

/// Strip `refs/heads/` so filters can be written as plain branch names
pub fn normalize_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

/// Match a branch name against glob patterns; invalid patterns never match
pub fn any_match(patterns: &[String], branch: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    patterns.iter().any(|p| {
        Pattern::new(p)
            .map(|pattern| pattern.matches_with(branch, options))
            .unwrap_or(false)
    })
}
