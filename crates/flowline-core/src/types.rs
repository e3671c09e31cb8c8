use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::RunEvent;

/// Value produced by a unit: plain text or a structured JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    pub fn empty() -> Self {
        Content::Text(String::new())
    }

    /// Borrow the text if this is a text payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Structured(serde_json::Value::String(s)) => Some(s),
            Content::Structured(_) => None,
        }
    }

    /// Render as text. Structured payloads are pretty-printed JSON.
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Structured(serde_json::Value::String(s)) => s.clone(),
            Content::Structured(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
        }
    }

    /// True for an empty string or a null value. Whitespace counts as content.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Structured(v) => v.is_null(),
        }
    }

    /// Length of the rendered text in characters.
    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(s) => s.chars().count(),
            other => other.to_text().chars().count(),
        }
    }

    /// Convert into a JSON value (text becomes a JSON string).
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Content::Text(s) => serde_json::Value::String(s.clone()),
            Content::Structured(v) => v.clone(),
        }
    }

    /// Fold partial contents into one. A single part is kept as-is so
    /// structured payloads survive; several parts are concatenated as text.
    pub fn concat(parts: &[Content]) -> Content {
        match parts {
            [] => Content::empty(),
            [only] => only.clone(),
            many => Content::Text(many.iter().map(Content::to_text).collect()),
        }
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::empty()
    }
}

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<serde_json::Value> for Content {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => Content::Text(s),
            other => Content::Structured(other),
        }
    }
}

/// The value supplied to a workflow invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub message: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl WorkflowInput {
    pub fn new(message: impl Into<Content>) -> Self {
        Self {
            message: message.into(),
            additional_data: None,
        }
    }

    pub fn with_additional_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.additional_data = Some(data);
        self
    }
}

impl From<&str> for WorkflowInput {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for WorkflowInput {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<serde_json::Value> for WorkflowInput {
    fn from(v: serde_json::Value) -> Self {
        Self::new(v)
    }
}

/// What produced a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    Function,
    Agent,
    Team,
    Steps,
    Parallel,
    Loop,
    Iteration,
    Condition,
    Router,
}

impl UnitKind {
    /// Atomic kinds wrap exactly one executor; the rest compose other units.
    pub fn is_atomic(&self) -> bool {
        matches!(self, UnitKind::Function | UnitKind::Agent | UnitKind::Team)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Function => "function",
            UnitKind::Agent => "agent",
            UnitKind::Team => "team",
            UnitKind::Steps => "steps",
            UnitKind::Parallel => "parallel",
            UnitKind::Loop => "loop",
            UnitKind::Iteration => "iteration",
            UnitKind::Condition => "condition",
            UnitKind::Router => "router",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The result a unit produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub kind: UnitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub content: Content,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Terminates the whole run once recorded.
    #[serde(default, skip_serializing_if = "is_false")]
    pub halt: bool,
    /// Set on a Condition whose evaluator returned false.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepResult>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl StepResult {
    /// A successful result carrying `content`.
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            step_name: String::new(),
            kind: UnitKind::Function,
            executor_name: None,
            content: content.into(),
            success: true,
            error: None,
            halt: false,
            skipped: false,
            children: Vec::new(),
            elapsed_ms: 0,
            metrics: None,
        }
    }

    /// A failed result; the message doubles as content.
    pub fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            error: Some(message.clone()),
            ..Self::new(message)
        }
    }

    /// Mark this result as terminal for the whole run.
    pub fn halted(mut self) -> Self {
        self.halt = true;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.step_name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: UnitKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_children(mut self, children: Vec<StepResult>) -> Self {
        self.children = children;
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// True if this result or anything beneath it requested a halt.
    pub fn halt_requested(&self) -> bool {
        self.halt || self.children.iter().any(StepResult::halt_requested)
    }

    /// Append every atomic result in this tree to `out`, in execution order.
    pub fn collect_atomic(&self, out: &mut Vec<StepResult>) {
        if self.kind.is_atomic() {
            out.push(self.clone());
        } else {
            for child in &self.children {
                child.collect_atomic(out);
            }
        }
    }
}

impl Default for StepResult {
    fn default() -> Self {
        Self::new(Content::empty())
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Halted,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Halted | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Halted => "halted",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step metrics entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub executor_type: UnitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_name: Option<String>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

/// Metrics aggregated over every atomic step of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_steps: usize,
    pub total_elapsed_ms: u64,
    pub steps: BTreeMap<String, StepMetrics>,
}

impl WorkflowMetrics {
    pub fn from_results(results: &[StepResult], total_elapsed_ms: u64) -> Self {
        let steps = results
            .iter()
            .map(|r| {
                (
                    r.step_name.clone(),
                    StepMetrics {
                        executor_type: r.kind,
                        executor_name: r.executor_name.clone(),
                        elapsed_ms: r.elapsed_ms,
                        metrics: r.metrics.clone(),
                    },
                )
            })
            .collect();
        Self {
            total_steps: results.len(),
            total_elapsed_ms,
            steps,
        }
    }
}

/// Everything a single run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunResponse {
    pub run_id: String,
    pub session_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<WorkflowInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Every atomic step that executed, flattened in execution order.
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// One result tree per executed top-level unit.
    #[serde(default)]
    pub unit_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<RunEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<WorkflowMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRunResponse {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: None,
            user_id: None,
            status: RunStatus::Pending,
            input: None,
            content: None,
            error: None,
            step_results: Vec::new(),
            unit_results: Vec::new(),
            events: None,
            metrics: None,
            extra_data: None,
            created_at: Utc::now(),
        }
    }

    /// The last atomic result that executed.
    pub fn last_result(&self) -> Option<&StepResult> {
        self.step_results.last()
    }

    /// Whether the run stopped on a halt rather than running to completion.
    pub fn is_halted(&self) -> bool {
        self.status == RunStatus::Halted || self.last_result().is_some_and(|r| r.halt)
    }

    /// Names of the atomic steps that executed, in order.
    pub fn executed_step_names(&self) -> Vec<&str> {
        self.step_results.iter().map(|r| r.step_name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_concat() {
        assert_eq!(Content::concat(&[]), Content::empty());
        let single = Content::Structured(serde_json::json!({"a": 1}));
        assert_eq!(Content::concat(&[single.clone()]), single);
        let joined = Content::concat(&["ab".into(), "cd".into()]);
        assert_eq!(joined, Content::text("abcd"));
    }

    #[test]
    fn test_whitespace_is_content() {
        assert!(Content::empty().is_empty());
        assert!(Content::Structured(serde_json::Value::Null).is_empty());
        assert!(!Content::text("  ").is_empty());
    }

    #[test]
    fn test_content_from_json_string_is_text() {
        let c: Content = serde_json::json!("hello").into();
        assert_eq!(c.as_str(), Some("hello"));
        assert_eq!(c.char_len(), 5);
    }

    #[test]
    fn test_failure_result() {
        let r = StepResult::failure("boom").with_name("s1");
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert_eq!(r.content.to_text(), "boom");
        assert!(!r.halt);
    }

    #[test]
    fn test_halt_requested_nested() {
        let inner = StepResult::new("x").halted();
        let outer = StepResult::new("y")
            .with_kind(UnitKind::Parallel)
            .with_children(vec![StepResult::new("z"), inner]);
        assert!(outer.halt_requested());
        assert!(!outer.halt);
    }

    #[test]
    fn test_collect_atomic_skips_composites() {
        let tree = StepResult::new("agg")
            .with_name("loop")
            .with_kind(UnitKind::Loop)
            .with_children(vec![
                StepResult::new("")
                    .with_name("loop#1")
                    .with_kind(UnitKind::Iteration)
                    .with_children(vec![StepResult::new("a").with_name("a")]),
                StepResult::new("")
                    .with_name("loop#2")
                    .with_kind(UnitKind::Iteration)
                    .with_children(vec![StepResult::new("b").with_name("b")]),
            ]);
        let mut out = Vec::new();
        tree.collect_atomic(&mut out);
        let names: Vec<_> = out.iter().map(|r| r.step_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_step_result_serde_defaults() {
        let r: StepResult = serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert!(r.success);
        assert!(!r.halt);
        assert_eq!(r.content, Content::text("hi"));

        let json = serde_json::to_string(&StepResult::new("x")).unwrap();
        assert!(!json.contains("halt"));
        assert!(!json.contains("children"));
    }

    #[test]
    fn test_metrics_from_results() {
        let mut a = StepResult::new("a").with_name("a");
        a.elapsed_ms = 5;
        let b = StepResult::new("b").with_name("b").with_kind(UnitKind::Agent);
        let m = WorkflowMetrics::from_results(&[a, b], 12);
        assert_eq!(m.total_steps, 2);
        assert_eq!(m.steps["a"].elapsed_ms, 5);
        assert_eq!(m.steps["b"].executor_type, UnitKind::Agent);
    }
}
