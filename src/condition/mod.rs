// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Job and step conditions
//!
//! Conditions are written as small boolean expressions in the definition
//! (`if: "event == 'push' && !draft"`) and parsed once at load time into an
//! [`Expr`] tree. Evaluation is pure and fails closed: an expression that
//! touches an undefined variable or an unfinished job evaluates to `false`.

mod parser;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::JobStatus;
use crate::errors::JobflowError;
use crate::trigger::RunContext;

/// A parsed condition together with its source text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a condition expression
    pub fn parse(source: &str) -> Result<Self, JobflowError> {
        let expr = parser::parse(source).map_err(|reason| JobflowError::InvalidCondition {
            expression: source.to_string(),
            reason,
        })?;

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The expression as written in the definition
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed expression tree
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a context; undefined references yield `false`
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        match eval(&self.expr, ctx) {
            Ok(value) => value,
            Err(undefined) => {
                tracing::debug!(
                    condition = %self.source,
                    reference = %undefined.0,
                    "condition references an undefined value, treating as false"
                );
                false
            }
        }
    }
}

impl TryFrom<String> for Condition {
    type Error = JobflowError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::parse(&source)
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.source
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Boolean expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(bool),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Equals(Operand, Operand),
    NotEquals(Operand, Operand),
    /// `needs.<job>.result == '<status>'`
    HasStatus { job: String, status: JobStatus },
    /// A bare operand used as a boolean, e.g. `draft`
    Truthy(Operand),
}

/// Leaf of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(Variable),
    Str(String),
    Bool(bool),
}

/// Run context values addressable from a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    Event,
    Ref,
    Draft,
    Protected,
    Actor,
    Activity,
    /// `vars.<name>` declared in the definition or passed on the command line
    Declared(String),
}

/// Everything a condition can observe
pub struct ConditionContext<'a> {
    pub run: &'a RunContext,
    /// Terminal statuses of jobs that have finished so far
    pub results: &'a HashMap<String, JobStatus>,
}

impl<'a> ConditionContext<'a> {
    pub fn new(run: &'a RunContext, results: &'a HashMap<String, JobStatus>) -> Self {
        Self { run, results }
    }
}

#[derive(Debug)]
struct Undefined(String);

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Str(s) => s.as_str().into(),
            Self::Bool(b) => b.to_string().into(),
        }
    }
}

fn eval(expr: &Expr, ctx: &ConditionContext<'_>) -> Result<bool, Undefined> {
    match expr {
        Expr::Literal(b) => Ok(*b),
        Expr::And(lhs, rhs) => Ok(eval(lhs, ctx)? && eval(rhs, ctx)?),
        Expr::Or(lhs, rhs) => Ok(eval(lhs, ctx)? || eval(rhs, ctx)?),
        Expr::Not(inner) => Ok(!eval(inner, ctx)?),
        Expr::Equals(lhs, rhs) => Ok(resolve(lhs, ctx)?.text() == resolve(rhs, ctx)?.text()),
        Expr::NotEquals(lhs, rhs) => Ok(resolve(lhs, ctx)?.text() != resolve(rhs, ctx)?.text()),
        Expr::HasStatus { job, status } => ctx
            .results
            .get(job)
            .map(|actual| actual == status)
            .ok_or_else(|| Undefined(format!("needs.{}.result", job))),
        Expr::Truthy(operand) => Ok(resolve(operand, ctx)?.truthy()),
    }
}

fn resolve(operand: &Operand, ctx: &ConditionContext<'_>) -> Result<Value, Undefined> {
    let run = ctx.run;
    match operand {
        Operand::Str(s) => Ok(Value::Str(s.clone())),
        Operand::Bool(b) => Ok(Value::Bool(*b)),
        Operand::Var(var) => match var {
            Variable::Event => Ok(Value::Str(run.event.to_string())),
            Variable::Ref => Ok(Value::Str(run.git_ref.clone())),
            Variable::Draft => Ok(Value::Bool(run.draft)),
            Variable::Protected => Ok(Value::Bool(run.protected)),
            Variable::Actor => run
                .actor
                .clone()
                .map(Value::Str)
                .ok_or_else(|| Undefined("actor".into())),
            Variable::Activity => run
                .activity
                .clone()
                .map(Value::Str)
                .ok_or_else(|| Undefined("activity".into())),
            Variable::Declared(name) => run
                .variables
                .get(name)
                .cloned()
                .map(Value::Str)
                .ok_or_else(|| Undefined(format!("vars.{}", name))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::EventKind;

    fn context(event: EventKind, git_ref: &str, draft: bool) -> RunContext {
        RunContext {
            event,
            git_ref: git_ref.into(),
            draft,
            protected: git_ref == "main",
            actor: Some("octocat".into()),
            activity: None,
            variables: HashMap::from([("rust".to_string(), "stable".to_string())]),
            metadata: HashMap::new(),
        }
    }

    fn check(source: &str, run: &RunContext, results: &HashMap<String, JobStatus>) -> bool {
        Condition::parse(source)
            .unwrap()
            .evaluate(&ConditionContext::new(run, results))
    }

    #[test]
    fn test_event_and_ref_comparisons() {
        let run = context(EventKind::Push, "main", false);
        let results = HashMap::new();

        assert!(check("event == 'push'", &run, &results));
        assert!(check("event == 'push' && ref == 'main'", &run, &results));
        assert!(!check("event == 'pull_request' || ref != 'main'", &run, &results));
        assert!(check("protected && !draft", &run, &results));
        assert!(check("vars.rust == 'stable'", &run, &results));
        assert!(check("always()", &run, &results));
    }

    #[test]
    fn test_undefined_variable_fails_closed() {
        let run = context(EventKind::Push, "main", false);
        let results = HashMap::new();

        assert!(!check("vars.missing == 'x'", &run, &results));
        assert!(!check("!(vars.missing == 'x')", &run, &results));
        assert!(!check("activity == 'opened'", &run, &results));
    }

    #[test]
    fn test_short_circuit_skips_undefined_branch() {
        let run = context(EventKind::Push, "main", false);
        let results = HashMap::new();

        assert!(check("event == 'push' || vars.missing == 'x'", &run, &results));
        assert!(!check("event == 'schedule' && vars.missing == 'x'", &run, &results));
    }

    #[test]
    fn test_job_results() {
        let run = context(EventKind::Push, "main", false);
        let results = HashMap::from([
            ("build".to_string(), JobStatus::Succeeded),
            ("lint".to_string(), JobStatus::Failed),
        ]);

        assert!(check("needs.build.result == 'success'", &run, &results));
        assert!(check("needs.lint.result == 'failure'", &run, &results));
        assert!(check("needs.lint.result != 'success'", &run, &results));
        // Unfinished or unknown jobs are undefined
        assert!(!check("needs.deploy.result != 'success'", &run, &results));
    }
}
