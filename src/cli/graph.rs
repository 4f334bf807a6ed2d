// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Graph command - visualize the job graph

use miette::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use super::{report_definition_error, GraphFormat};
use crate::pipeline::Pipeline;

/// Run the graph command
pub async fn run(definition_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<ExitCode> {
    let pipeline = match Pipeline::load(&definition_path) {
        Ok(pipeline) => pipeline,
        Err(e) if e.is_definition_error() => return Ok(report_definition_error(e)),
        Err(e) => return Err(e.into()),
    };

    let graph = pipeline.graph();
    let output = match format {
        GraphFormat::Text => graph.to_text(pipeline.definition())?,
        GraphFormat::Dot => graph.to_dot(),
        GraphFormat::Mermaid => graph.to_mermaid(),
    };

    println!("{}", output);

    Ok(ExitCode::SUCCESS)
}
