use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use flowline_core::state::SessionState;
use flowline_core::types::{Content, StepResult, UnitKind, WorkflowInput};

/// Name-keyed results in the order they were last recorded.
#[derive(Debug, Clone, Default)]
struct PriorResults {
    order: Vec<String>,
    by_name: HashMap<String, StepResult>,
}

impl PriorResults {
    /// Insert or overwrite. An overwritten name moves to the end of the order.
    fn insert(&mut self, name: &str, result: StepResult) {
        if self.by_name.insert(name.to_string(), result).is_some() {
            self.order.retain(|n| n != name);
        }
        self.order.push(name.to_string());
    }

    fn get(&self, name: &str) -> Option<&StepResult> {
        self.by_name.get(name)
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &StepResult)> {
        self.order
            .iter()
            .filter_map(|n| self.by_name.get(n).map(|r| (n.as_str(), r)))
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Everything a unit can see when it starts: the run input, the previous
/// unit's content, every earlier result by name, and the shared session state.
///
/// Contexts are cheap to clone. A clone is a snapshot of the results; only the
/// session state is shared between clones.
#[derive(Debug, Clone)]
pub struct StepContext {
    input: Arc<WorkflowInput>,
    previous_content: Option<Content>,
    prior: PriorResults,
    session_state: SessionState,
    session_id: String,
    user_id: Option<String>,
}

impl StepContext {
    pub fn new(
        input: WorkflowInput,
        session_state: SessionState,
        session_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            input: Arc::new(input),
            previous_content: None,
            prior: PriorResults::default(),
            session_state,
            session_id: session_id.into(),
            user_id,
        }
    }

    pub fn input(&self) -> &WorkflowInput {
        &self.input
    }

    /// The workflow input message rendered as text.
    pub fn input_text(&self) -> String {
        self.input.message.to_text()
    }

    pub fn additional_data(&self) -> Option<&Map<String, Value>> {
        self.input.additional_data.as_ref()
    }

    /// Content of the unit that ran immediately before, `None` for the first unit.
    pub fn previous_content(&self) -> Option<&Content> {
        self.previous_content.as_ref()
    }

    pub fn get_last_step_content(&self) -> Option<&Content> {
        self.previous_content.as_ref()
    }

    /// What a collaborator should receive: the previous content, or the input.
    pub fn collaborator_input(&self) -> Content {
        self.previous_content
            .clone()
            .unwrap_or_else(|| self.input.message.clone())
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session_state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn get_step_result(&self, name: &str) -> Option<&StepResult> {
        self.prior.get(name)
    }

    /// Content of a prior unit by name.
    ///
    /// A Parallel block answers with a map of its branches' content keyed by
    /// branch name.
    pub fn get_step_content(&self, name: &str) -> Option<Content> {
        let result = self.prior.get(name)?;
        if result.kind == UnitKind::Parallel {
            let branches: Map<String, Value> = result
                .children
                .iter()
                .map(|c| (c.step_name.clone(), c.content.to_value()))
                .collect();
            return Some(Content::Structured(Value::Object(branches)));
        }
        Some(result.content.clone())
    }

    /// Every earlier atomic step's content as `=== name ===` sections, in
    /// execution order.
    pub fn get_all_previous_content(&self) -> String {
        self.prior
            .iter()
            .filter(|(_, r)| r.kind.is_atomic())
            .map(|(name, r)| format!("=== {} ===\n{}", name, r.content.to_text()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Names recorded so far, in execution order.
    pub fn prior_names(&self) -> Vec<&str> {
        self.prior.iter().map(|(n, _)| n).collect()
    }

    pub fn prior_results(&self) -> impl Iterator<Item = (&str, &StepResult)> {
        self.prior.iter()
    }

    pub fn prior_count(&self) -> usize {
        self.prior.len()
    }

    /// Record a finished unit so later units can see it.
    ///
    /// Nested results are registered first, then the unit itself. Loop
    /// iteration wrappers are not addressable by name, and a skipped
    /// Condition leaves the context untouched.
    pub fn record(&mut self, result: &StepResult) {
        if result.skipped {
            return;
        }
        self.register(result);
        self.previous_content = Some(result.content.clone());
    }

    fn register(&mut self, result: &StepResult) {
        if result.skipped {
            return;
        }
        for child in &result.children {
            self.register(child);
        }
        if result.kind != UnitKind::Iteration && !result.step_name.is_empty() {
            self.prior.insert(&result.step_name, result.clone());
        }
    }
}
