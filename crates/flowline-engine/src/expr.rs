//! Small condition language used by declarative workflows.
//!
//! Supported forms:
//! - `key == "value"` / `key != "value"`: exact match
//! - `key contains "substr"`: substring match
//! - `len(key) > N` (also `<`, `>=`, `<=`, `==`): length in characters
//! - `true` / `false`
//! - `a && b`, `a || b` (`&&` binds tighter; no parentheses)
//!
//! Keys resolve through a lookup function. A missing key makes comparisons
//! false and has length 0.

use std::fmt;
use std::str::FromStr;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::types::StepResult;

use crate::context::StepContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl LengthOp {
    fn holds(&self, lhs: usize, rhs: usize) -> bool {
        match self {
            LengthOp::Gt => lhs > rhs,
            LengthOp::Lt => lhs < rhs,
            LengthOp::Ge => lhs >= rhs,
            LengthOp::Le => lhs <= rhs,
            LengthOp::Eq => lhs == rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(bool),
    Compare {
        key: String,
        op: CompareOp,
        value: String,
    },
    Length {
        key: String,
        op: LengthOp,
        value: usize,
    },
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(invalid(source, "empty expression"));
        }

        let alternatives: Vec<&str> = source.split("||").collect();
        if alternatives.len() > 1 {
            return alternatives
                .into_iter()
                .map(Expr::parse)
                .collect::<Result<Vec<_>>>()
                .map(Expr::Any);
        }

        let conjuncts: Vec<&str> = source.split("&&").collect();
        if conjuncts.len() > 1 {
            return conjuncts
                .into_iter()
                .map(Expr::parse)
                .collect::<Result<Vec<_>>>()
                .map(Expr::All);
        }

        parse_atom(source)
    }

    /// Evaluate against a key lookup.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<String>) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Compare { key, op, value } => lookup(key).is_some_and(|actual| match op {
                CompareOp::Eq => actual == *value,
                CompareOp::Ne => actual != *value,
                CompareOp::Contains => actual.contains(value.as_str()),
            }),
            Expr::Length { key, op, value } => {
                let len = lookup(key).map(|s| s.chars().count()).unwrap_or(0);
                op.holds(len, *value)
            }
            Expr::All(parts) => parts.iter().all(|p| p.evaluate(lookup)),
            Expr::Any(parts) => parts.iter().any(|p| p.evaluate(lookup)),
        }
    }

    /// Evaluate against a step context.
    ///
    /// Keys: `input`, `previous`, `state.<key>`, or the name of a prior unit.
    pub fn evaluate_context(&self, ctx: &StepContext) -> bool {
        self.evaluate(&|key: &str| context_value(ctx, key))
    }

    /// Evaluate against one loop iteration's results.
    ///
    /// Keys: `previous` (the last result) or the name of any step in the results.
    pub fn evaluate_results(&self, results: &[StepResult]) -> bool {
        let mut flat = Vec::new();
        for r in results {
            flat.push(r.clone());
            r.collect_atomic(&mut flat);
        }
        self.evaluate(&|key: &str| {
            if key == "previous" {
                return results.last().map(|r| r.content.to_text());
            }
            flat.iter()
                .rev()
                .find(|r| r.step_name == key)
                .map(|r| r.content.to_text())
        })
    }
}

impl FromStr for Expr {
    type Err = FlowlineError;

    fn from_str(s: &str) -> Result<Self> {
        Expr::parse(s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(b) => write!(f, "{}", b),
            Expr::Compare { key, op, value } => {
                let op = match op {
                    CompareOp::Eq => "==",
                    CompareOp::Ne => "!=",
                    CompareOp::Contains => "contains",
                };
                write!(f, "{} {} \"{}\"", key, op, value)
            }
            Expr::Length { key, op, value } => {
                let op = match op {
                    LengthOp::Gt => ">",
                    LengthOp::Lt => "<",
                    LengthOp::Ge => ">=",
                    LengthOp::Le => "<=",
                    LengthOp::Eq => "==",
                };
                write!(f, "len({}) {} {}", key, op, value)
            }
            Expr::All(parts) => write_joined(f, parts, " && "),
            Expr::Any(parts) => write_joined(f, parts, " || "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Expr], sep: &str) -> fmt::Result {
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", p)?;
    }
    Ok(())
}

/// Resolve an expression key against a step context.
pub fn context_value(ctx: &StepContext, key: &str) -> Option<String> {
    match key {
        "input" => Some(ctx.input_text()),
        "previous" => ctx.previous_content().map(|c| c.to_text()),
        _ => {
            if let Some(state_key) = key.strip_prefix("state.") {
                return ctx.session_state().get(state_key).map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            ctx.get_step_content(key).map(|c| c.to_text())
        }
    }
}

/// Evaluate an expression string, returning `false` if it does not parse.
pub fn evaluate_condition(expr: &str, ctx: &StepContext) -> bool {
    Expr::parse(expr).is_ok_and(|e| e.evaluate_context(ctx))
}

fn parse_atom(source: &str) -> Result<Expr> {
    match source {
        "true" => return Ok(Expr::Literal(true)),
        "false" => return Ok(Expr::Literal(false)),
        _ => {}
    }

    if let Some(rest) = source.strip_prefix("len(") {
        let (key, tail) = rest
            .split_once(')')
            .ok_or_else(|| invalid(source, "unclosed len("))?;
        let tail = tail.trim();
        let (op, number) = [
            (">=", LengthOp::Ge),
            ("<=", LengthOp::Le),
            ("==", LengthOp::Eq),
            (">", LengthOp::Gt),
            ("<", LengthOp::Lt),
        ]
        .iter()
        .find_map(|(sym, op)| tail.strip_prefix(sym).map(|n| (*op, n.trim())))
        .ok_or_else(|| invalid(source, "expected a comparison after len()"))?;
        let value = number
            .parse::<usize>()
            .map_err(|_| invalid(source, "length must be a non-negative integer"))?;
        return Ok(Expr::Length {
            key: key.trim().to_string(),
            op,
            value,
        });
    }

    for (sym, op) in [
        (" contains ", CompareOp::Contains),
        ("!=", CompareOp::Ne),
        ("==", CompareOp::Eq),
    ] {
        if let Some((key, value)) = parse_operator(source, sym) {
            if key.is_empty() {
                return Err(invalid(source, "missing key"));
            }
            return Ok(Expr::Compare {
                key: key.to_string(),
                op,
                value: value.to_string(),
            });
        }
    }

    Err(invalid(source, "unrecognized expression"))
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    Some((key.trim(), val.trim().trim_matches('"')))
}

fn invalid(source: &str, reason: &str) -> FlowlineError {
    FlowlineError::InvalidWorkflow(format!("bad expression '{}': {}", source, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::state::SessionState;
    use flowline_core::types::WorkflowInput;
    use serde_json::json;

    fn ctx(input: &str) -> StepContext {
        StepContext::new(WorkflowInput::new(input), SessionState::new(), "sess", None)
    }

    #[test]
    fn test_condition_equals() {
        let mut c = ctx("in");
        c.record(&StepResult::new("success").with_name("status"));
        assert!(evaluate_condition(r#"status == "success""#, &c));
        assert!(!evaluate_condition(r#"status == "failure""#, &c));
    }

    #[test]
    fn test_condition_not_equals() {
        let mut c = ctx("in");
        c.record(&StepResult::new("success").with_name("status"));
        assert!(evaluate_condition(r#"status != "failure""#, &c));
        assert!(!evaluate_condition(r#"status != "success""#, &c));
    }

    #[test]
    fn test_condition_contains() {
        let c = ctx("The file was created successfully.");
        assert!(evaluate_condition(r#"input contains "created""#, &c));
        assert!(!evaluate_condition(r#"input contains "deleted""#, &c));
    }

    #[test]
    fn test_length_comparisons() {
        let short = ctx("hello");
        let long = ctx("twenty characters!!!");
        assert!(!evaluate_condition("len(input) > 10", &short));
        assert!(evaluate_condition("len(input) > 10", &long));
        assert!(evaluate_condition("len(input) <= 5", &short));
        assert!(evaluate_condition("len(missing) == 0", &short));
    }

    #[test]
    fn test_state_and_previous_keys() {
        let state = SessionState::new();
        state.set("mode", json!("strict"));
        state.set("attempts", json!(2));
        let mut c = StepContext::new(WorkflowInput::new("x"), state, "sess", None);
        assert!(!evaluate_condition(r#"previous == "x""#, &c));
        c.record(&StepResult::new("draft").with_name("a"));
        assert!(evaluate_condition(r#"previous == "draft""#, &c));
        assert!(evaluate_condition(r#"state.mode == "strict""#, &c));
        assert!(evaluate_condition(r#"state.attempts == "2""#, &c));
    }

    #[test]
    fn test_and_or() {
        let c = ctx("alpha beta");
        assert!(evaluate_condition(r#"input contains "alpha" && input contains "beta""#, &c));
        assert!(!evaluate_condition(r#"input contains "alpha" && input contains "gamma""#, &c));
        assert!(evaluate_condition(r#"input contains "gamma" || len(input) > 3"#, &c));
    }

    #[test]
    fn test_missing_key_and_invalid_expr() {
        let c = ctx("x");
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
        assert!(!evaluate_condition(r#"missing != "value""#, &c));
        assert!(!evaluate_condition("this is not valid", &c));
        assert!(Expr::parse("len(input > 3").is_err());
        assert!(Expr::parse("len(input) > many").is_err());
        assert!(Expr::parse("").is_err());
    }

    #[test]
    fn test_results_lookup() {
        let results = vec![
            StepResult::new("draft v2").with_name("write"),
            StepResult::new("APPROVED").with_name("review"),
        ];
        let done: Expr = r#"previous contains "APPROVED""#.parse().unwrap();
        assert!(done.evaluate_results(&results));
        let wrote: Expr = r#"write == "draft v2""#.parse().unwrap();
        assert!(wrote.evaluate_results(&results));
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        let e = Expr::parse(r#"len(input) >= 3 && previous != "no""#).unwrap();
        assert_eq!(Expr::parse(&e.to_string()).unwrap(), e);
    }
}
