// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Pipeline validation
//!
//! Validates a definition once, at load, before any job is scheduled.

use std::collections::HashSet;

use crate::condition::Expr;
use crate::errors::JobflowError;
use crate::executors::{DOWNLOAD_ARTIFACT, UPLOAD_ARTIFACT};
use crate::pipeline::{Job, JobGraph, PipelineDefinition, StepAction};

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline definition
    pub fn validate(definition: &PipelineDefinition) -> ValidationResult {
        let mut result = ValidationResult::new();

        if definition.jobs.is_empty() {
            result.add_error(JobflowError::InvalidDefinition {
                reason: "pipeline has no jobs defined".into(),
                help: Some("Add at least one entry under 'jobs:'".into()),
            });
        }

        let mut seen_names = HashSet::new();
        for job in &definition.jobs {
            if !seen_names.insert(job.name.as_str()) {
                result.add_error(JobflowError::DuplicateJob {
                    job: job.name.clone(),
                });
            }
        }

        Self::validate_patterns(definition, &mut result);

        // Cycles and unknown needs; only meaningful once names are unique
        let graph = if result.is_valid() {
            match JobGraph::build(definition) {
                Ok(graph) => Some(graph),
                Err(e) => {
                    result.add_error(e);
                    None
                }
            }
        } else {
            None
        };

        for job in &definition.jobs {
            Self::validate_job(job, graph.as_ref(), &mut result);
        }

        result
    }

    fn validate_patterns(definition: &PipelineDefinition, result: &mut ValidationResult) {
        let patterns = definition
            .triggers
            .patterns()
            .into_iter()
            .chain(definition.protected_branches.iter().map(String::as_str));

        for pattern in patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                result.add_error(JobflowError::InvalidDefinition {
                    reason: format!("invalid branch pattern '{}': {}", pattern, e),
                    help: Some("Branch filters use glob syntax, e.g. 'release/*'".into()),
                });
            }
        }
    }

    fn validate_job(job: &Job, graph: Option<&JobGraph>, result: &mut ValidationResult) {
        if job.steps.is_empty() {
            result.add_error(JobflowError::InvalidDefinition {
                reason: format!("job '{}' has no steps", job.name),
                help: None,
            });
        }

        for step in &job.steps {
            if step.retry.max_attempts == 0 {
                result.add_error(JobflowError::InvalidDefinition {
                    reason: format!(
                        "step '{}' in job '{}' has retry.max_attempts = 0",
                        step.display_name(),
                        job.name
                    ),
                    help: Some("max_attempts counts the first attempt and must be at least 1".into()),
                });
            }

            if let StepAction::Uses { action, with } = &step.action {
                let builtin = action == UPLOAD_ARTIFACT || action == DOWNLOAD_ARTIFACT;
                if builtin && !with.contains_key("name") {
                    result.add_error(JobflowError::InvalidDefinition {
                        reason: format!("{} in job '{}' has no 'name'", action, job.name),
                        help: Some("Artifacts are addressed by name: 'with: { name: bin }'".into()),
                    });
                }
                if action == UPLOAD_ARTIFACT
                    && !with.contains_key("path")
                    && !with.contains_key("content")
                {
                    result.add_error(JobflowError::InvalidDefinition {
                        reason: format!(
                            "{} in job '{}' needs either 'path' or 'content'",
                            action, job.name
                        ),
                        help: None,
                    });
                }
            }

            if let (Some(job_timeout), Some(step_timeout)) = (job.timeout, step.timeout) {
                if step_timeout > job_timeout {
                    result.add_warning(&format!(
                        "Step '{}' timeout exceeds the timeout of job '{}'",
                        step.display_name(),
                        job.name
                    ));
                }
            }
        }

        if job.needs.is_empty() && job.uses_action(DOWNLOAD_ARTIFACT) {
            result.add_warning(&format!(
                "Job '{}' downloads an artifact but needs no other job",
                job.name
            ));
        }

        let Some(graph) = graph else {
            return;
        };

        let conditions = job
            .condition
            .iter()
            .chain(job.steps.iter().filter_map(|s| s.condition.as_ref()));

        for condition in conditions {
            let mut referenced = Vec::new();
            collect_job_refs(condition.expr(), &mut referenced);

            for other in referenced {
                if !graph.depends_on(&job.name, other) {
                    result.add_warning(&format!(
                        "Job '{}' checks needs.{}.result without needing '{}'; the condition will be false",
                        job.name, other, other
                    ));
                }
            }
        }
    }
}

fn collect_job_refs<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::HasStatus { job, .. } => out.push(job),
        Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            collect_job_refs(lhs, out);
            collect_job_refs(rhs, out);
        }
        Expr::Not(inner) => collect_job_refs(inner, out),
        _ => {}
    }
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<JobflowError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: JobflowError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// The first error, consuming the result
    pub fn into_first_error(self) -> Option<JobflowError> {
        self.errors.into_iter().next()
    }
}
