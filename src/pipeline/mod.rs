// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Pipeline definitions and types
//!
//! This module defines the definition schema (jobs, steps, retry policies),
//! the job dependency graph and load-time validation. A [`Pipeline`] is the
//! validated, immutable form shared by every run of a definition.

mod dag;
mod definition;
pub mod duration;
mod validation;

pub use dag::JobGraph;
pub use definition::*;
pub use validation::{PipelineValidator, ValidationResult};

use std::path::Path;

use crate::errors::JobflowResult;

/// A validated definition together with its dependency graph
#[derive(Debug, Clone)]
pub struct Pipeline {
    definition: PipelineDefinition,
    graph: JobGraph,
    order: Vec<usize>,
    warnings: Vec<String>,
}

impl Pipeline {
    /// Validate a definition; the first error aborts
    pub fn new(definition: PipelineDefinition) -> JobflowResult<Self> {
        let result = PipelineValidator::validate(&definition);
        let warnings = result.warnings.clone();

        if let Some(error) = result.into_first_error() {
            return Err(error);
        }

        let graph = JobGraph::build(&definition)?;
        let order = graph.topological_order()?;

        Ok(Self {
            definition,
            graph,
            order,
            warnings,
        })
    }

    /// Load and validate a definition file
    pub fn load(path: &Path) -> JobflowResult<Self> {
        Self::new(PipelineDefinition::from_file(path)?)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Indices into `definition().jobs`, dependencies first
    pub fn execution_order(&self) -> &[usize] {
        &self.order
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Non-fatal findings from validation
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
