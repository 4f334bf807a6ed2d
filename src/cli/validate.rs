// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Validate command - check a pipeline definition

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use super::report_definition_error;
use crate::pipeline::{JobGraph, PipelineDefinition, PipelineValidator};

/// Run the validate command
pub async fn run(definition_path: PathBuf, verbose: bool) -> Result<ExitCode> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let definition = match PipelineDefinition::from_file(&definition_path) {
        Ok(definition) => definition,
        Err(e) if e.is_definition_error() => {
            println!("  {} Failed to parse definition", "✗".red());
            println!();
            return Ok(report_definition_error(e));
        }
        Err(e) => return Err(e.into()),
    };

    println!("  {} Definition file is valid YAML", "✓".green());

    let validation = PipelineValidator::validate(&definition);

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
            if let Some(suggestion) = error.recovery() {
                println!("{}", suggestion.to_string().dimmed());
            }
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose && validation.is_valid() {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", definition.name);
        println!("  Jobs: {}", definition.jobs.len());
        for job in &definition.jobs {
            let needs = if job.needs.is_empty() {
                String::new()
            } else {
                format!(" [needs: {}]", job.needs.join(", "))
            };
            println!("    - {} ({} steps){}", job.name, job.steps.len(), needs.dimmed());
        }

        if let Ok(graph) = JobGraph::build(&definition) {
            if let Ok(order) = graph.topological_order_names() {
                println!("  Order: {}", order.join(" → "));
            }
        }
    }

    println!();

    if !validation.is_valid() {
        println!("{}", "Pipeline definition is invalid.".red().bold());
        return Ok(ExitCode::from(super::EXIT_DEFINITION_ERROR));
    }

    if validation.has_warnings() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
    }

    Ok(ExitCode::SUCCESS)
}
