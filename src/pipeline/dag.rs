// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Job dependency graph
//!
//! Builds and validates the `needs` graph of a definition, ensuring a proper
//! execution order and detecting cycles.

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use crate::errors::JobflowError;
use crate::pipeline::PipelineDefinition;

/// Directed acyclic graph of jobs; edges point from a job to its dependents
#[derive(Debug, Clone)]
pub struct JobGraph {
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    index_to_name: HashMap<NodeIndex, String>,
}

impl JobGraph {
    fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            index_to_name: HashMap::new(),
        }
    }

    /// Build the graph of a definition
    ///
    /// Job names are assumed unique; duplicates are reported by the validator.
    pub fn build(definition: &PipelineDefinition) -> Result<Self, JobflowError> {
        let mut builder = Self::empty();

        for (idx, job) in definition.jobs.iter().enumerate() {
            let node = builder.graph.add_node(idx);
            builder.name_to_index.insert(job.name.clone(), node);
            builder.index_to_name.insert(node, job.name.clone());
        }

        for job in &definition.jobs {
            let job_node = builder.name_to_index[&job.name];

            for dep_name in &job.needs {
                let dep_node = builder.name_to_index.get(dep_name).ok_or_else(|| {
                    JobflowError::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep_name.clone(),
                    }
                })?;

                if !builder.graph.contains_edge(*dep_node, job_node) {
                    builder.graph.add_edge(*dep_node, job_node, ());
                }
            }
        }

        builder.validate_acyclic()?;

        Ok(builder)
    }

    fn validate_acyclic(&self) -> Result<(), JobflowError> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            JobflowError::CircularDependency {
                jobs: self.find_cycle_members(cycle.node_id()),
            }
        })
    }

    /// Walk from a node known to sit on a cycle until the walk closes
    fn find_cycle_members(&self, start: NodeIndex) -> Vec<String> {
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut on_path = HashSet::new();
        let mut cycle = Vec::new();

        depth_first_search(&self.graph, Some(start), |event| match event {
            DfsEvent::Discover(node, _) => {
                path.push(node);
                on_path.insert(node);
                Control::Continue
            }
            DfsEvent::BackEdge(_, target) => {
                if let Some(pos) = path.iter().position(|n| *n == target) {
                    cycle = path[pos..].to_vec();
                    cycle.push(target);
                }
                Control::Break(())
            }
            DfsEvent::Finish(node, _) => {
                if path.last() == Some(&node) {
                    path.pop();
                }
                on_path.remove(&node);
                Control::Continue
            }
            _ => Control::<()>::Continue,
        });

        if cycle.is_empty() {
            cycle.push(start);
        }

        cycle
            .into_iter()
            .map(|n| self.index_to_name[&n].clone())
            .collect()
    }

    /// Job indices (into `definition.jobs`) in a valid execution order
    pub fn topological_order(&self) -> Result<Vec<usize>, JobflowError> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|cycle| JobflowError::CircularDependency {
                jobs: self.find_cycle_members(cycle.node_id()),
            })
    }

    /// Job names in a valid execution order
    pub fn topological_order_names(&self) -> Result<Vec<String>, JobflowError> {
        toposort(&self.graph, None)
            .map(|nodes| {
                nodes
                    .into_iter()
                    .map(|n| self.index_to_name[&n].clone())
                    .collect()
            })
            .map_err(|cycle| JobflowError::CircularDependency {
                jobs: self.find_cycle_members(cycle.node_id()),
            })
    }

    /// Direct dependencies of a job
    pub fn dependencies(&self, job: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(job)?;
        Some(
            self.graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|n| self.index_to_name[&n].clone())
                .collect(),
        )
    }

    /// Jobs that directly need the given job
    pub fn dependents(&self, job: &str) -> Option<Vec<String>> {
        let node = self.name_to_index.get(job)?;
        Some(
            self.graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|n| self.index_to_name[&n].clone())
                .collect(),
        )
    }

    /// Whether `job_a` needs `job_b`, directly or transitively
    pub fn depends_on(&self, job_a: &str, job_b: &str) -> bool {
        let (Some(a), Some(b)) = (self.name_to_index.get(job_a), self.name_to_index.get(job_b))
        else {
            return false;
        };

        a != b && has_path_connecting(&self.graph, *b, *a, None)
    }

    /// Number of jobs in the graph
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn sorted_edges(&self) -> Vec<(&str, &str)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(from, to)| {
                (
                    self.index_to_name[&from].as_str(),
                    self.index_to_name[&to].as_str(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    fn sorted_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.name_to_index.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Generate a Mermaid diagram of the graph
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for name in self.sorted_names() {
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for (from, to) in self.sorted_edges() {
            out.push_str(&format!("    {} --> {}\n", from, to));
        }

        out
    }

    /// Generate a DOT diagram of the graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.sorted_edges() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        for name in self.sorted_names() {
            let node = self.name_to_index[name];
            if self.graph.neighbors_undirected(node).count() == 0 {
                out.push_str(&format!("    \"{}\";\n", name));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Text listing of the execution order
    pub fn to_text(&self, definition: &PipelineDefinition) -> Result<String, JobflowError> {
        let order = self.topological_order()?;
        let mut out = String::new();

        for (i, idx) in order.iter().enumerate() {
            let job = &definition.jobs[*idx];
            out.push_str(&format!(
                "{}. {} ({} step{})",
                i + 1,
                job.name,
                job.steps.len(),
                if job.steps.len() == 1 { "" } else { "s" }
            ));

            if !job.needs.is_empty() {
                out.push_str(&format!(" [needs: {}]", job.needs.join(", ")));
            }

            out.push('\n');
        }

        Ok(out)
    }
}
