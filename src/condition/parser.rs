// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Recursive-descent parser for condition expressions
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | "always()" | operand ( ("==" | "!=") operand )?
//! operand := 'string' | true | false | path
//! ```

use super::{Expr, Operand, Variable};
use crate::engine::JobStatus;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Str(String),
    Ident(String),
    Call(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' | '|' | '=' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => tokens.push(match c {
                        '&' => Token::And,
                        '|' => Token::Or,
                        _ => Token::Eq,
                    }),
                    _ => return Err(format!("expected '{}{}' at offset {}", c, c, pos)),
                }
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == '\'' {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(format!("unterminated string starting at offset {}", pos));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if matches!(chars.peek(), Some((_, '('))) {
                    chars.next();
                    match chars.next() {
                        Some((_, ')')) => tokens.push(Token::Call(ident)),
                        _ => return Err(format!("function '{}' takes no arguments", ident)),
                    }
                } else {
                    tokens.push(Token::Ident(ident));
                }
            }
            other => return Err(format!("unexpected character '{}' at offset {}", other, pos)),
        }
    }

    Ok(tokens)
}

/// Deepest run of `!` and `(` accepted
const MAX_NESTING: usize = 64;

/// Longest expression accepted, in tokens; bounds the depth of `&&`/`||` chains
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Parse a condition expression into an [`Expr`]
pub(super) fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("expression is empty".into());
    }
    if tokens.len() > MAX_TOKENS {
        return Err(format!("expression is longer than {} tokens", MAX_TOKENS));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;

    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected {:?} after expression", token)),
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("expression nests deeper than {} levels", MAX_NESTING));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing closing ')'".into()),
                }
            }
            Some(Token::Call(name)) => match name.as_str() {
                "always" => Ok(Expr::Literal(true)),
                other => Err(format!("unknown function '{}()'", other)),
            },
            Some(Token::Ident(path)) => {
                if let Some(job) = job_result_path(&path) {
                    return self.job_status(job);
                }
                let lhs = operand_from_ident(&path)?;
                self.comparison(lhs)
            }
            Some(Token::Str(value)) => self.comparison(Operand::Str(value)),
            Some(token) => Err(format!("unexpected {:?}", token)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn comparison(&mut self, lhs: Operand) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Eq) => {
                self.pos += 1;
                Ok(Expr::Equals(lhs, self.operand()?))
            }
            Some(Token::Ne) => {
                self.pos += 1;
                Ok(Expr::NotEquals(lhs, self.operand()?))
            }
            _ => Ok(Expr::Truthy(lhs)),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Operand::Str(value)),
            Some(Token::Ident(path)) => operand_from_ident(&path),
            Some(token) => Err(format!("expected a value, found {:?}", token)),
            None => Err("expected a value after comparison".into()),
        }
    }

    fn job_status(&mut self, job: String) -> Result<Expr, String> {
        let negate = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            _ => {
                return Err(format!(
                    "needs.{}.result must be compared with a status",
                    job
                ))
            }
        };

        let status = match self.next() {
            Some(Token::Str(name)) => JobStatus::from_result_name(&name)
                .ok_or_else(|| format!("unknown job result '{}'", name))?,
            _ => return Err("expected a quoted job result".into()),
        };

        let expr = Expr::HasStatus { job, status };
        Ok(if negate { Expr::Not(Box::new(expr)) } else { expr })
    }
}

fn job_result_path(path: &str) -> Option<String> {
    path.strip_prefix("needs.")
        .and_then(|rest| rest.strip_suffix(".result"))
        .filter(|job| !job.is_empty())
        .map(str::to_string)
}

fn operand_from_ident(ident: &str) -> Result<Operand, String> {
    let var = match ident {
        "true" => return Ok(Operand::Bool(true)),
        "false" => return Ok(Operand::Bool(false)),
        "event" | "event_name" => Variable::Event,
        "ref" => Variable::Ref,
        "draft" => Variable::Draft,
        "protected" => Variable::Protected,
        "actor" => Variable::Actor,
        "activity" => Variable::Activity,
        other => match other.strip_prefix("vars.") {
            Some(name) if !name.is_empty() => Variable::Declared(name.to_string()),
            _ => return Err(format!("unknown variable '{}'", other)),
        },
    };
    Ok(Operand::Var(var))
}
