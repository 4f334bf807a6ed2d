// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Error recovery suggestions
//!
//! Provides actionable suggestions for recovering from errors.

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Suggest installing a missing external action
    pub fn install_action(action: &str) -> Self {
        Self {
            action: format!("Install the '{}' action", action),
            steps: vec![
                format!("Steps using 'uses: {}' run an external executable", action),
                format!("jobflow looks for 'jobflow-action-{}' on your PATH", action),
            ],
            commands: vec![
                "# Check what is currently resolvable:".into(),
                format!("which jobflow-action-{}", action),
            ],
        }
    }

    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(jobs: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", jobs.join(" → ")),
                "Review the 'needs' lists of these jobs".into(),
                "Ensure jobs form a directed acyclic graph (DAG)".into(),
            ],
            commands: vec![
                "# Visualize your pipeline:".into(),
                "jobflow graph <definition> --format mermaid".into(),
            ],
        }
    }

    /// Suggest fixing a reference to a job that does not exist
    pub fn fix_unknown_dependency(job: &str, dependency: &str) -> Self {
        Self {
            action: format!("Fix the 'needs' list of job '{}'", job),
            steps: vec![
                format!("'{}' is not the name of any job in this pipeline", dependency),
                "Either define the job or remove it from 'needs'".into(),
            ],
            commands: vec![],
        }
    }

    /// Suggest renaming a job whose name is taken
    pub fn rename_duplicate_job(job: &str) -> Self {
        Self {
            action: format!("Rename one of the jobs called '{}'", job),
            steps: vec![
                "Job names identify jobs in 'needs' lists and run reports".into(),
                "Every job in a pipeline needs its own name".into(),
            ],
            commands: vec![],
        }
    }

    /// Suggest fixing invalid YAML
    pub fn fix_yaml_syntax(line: Option<usize>, column: Option<usize>) -> Self {
        let location = match (line, column) {
            (Some(l), Some(c)) => format!(" at line {}, column {}", l, c),
            (Some(l), None) => format!(" at line {}", l),
            _ => String::new(),
        };

        Self {
            action: format!("Fix pipeline definition syntax{}", location),
            steps: vec![
                "Check for common YAML issues:".into(),
                "  • Incorrect indentation (use spaces, not tabs)".into(),
                "  • Steps that set both 'run' and 'uses', or neither".into(),
                "  • Unquoted conditions containing ':' or '#'".into(),
            ],
            commands: vec![
                "# Check the definition without running it:".into(),
                "jobflow validate <definition>".into(),
            ],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_suggestion_lists_members() {
        let suggestion =
            RecoverySuggestion::fix_circular_dependency(&["lint".into(), "build".into()]);
        let rendered = suggestion.to_string();
        assert!(rendered.contains("lint → build"));
        assert!(rendered.contains("jobflow graph"));
    }
}
