use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::types::{StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::RunScope;
use crate::step::panic_message;
use crate::unit::{run_sequence, validate_all, Unit, UnitRef};

pub type Evaluator = Arc<dyn Fn(&StepContext) -> bool + Send + Sync>;

/// A guarded sub-sequence. When the evaluator says no, the body never runs.
pub struct Condition {
    name: String,
    description: Option<String>,
    evaluator: Evaluator,
    body: Vec<UnitRef>,
}

impl Condition {
    pub fn new<F>(name: impl Into<String>, evaluator: F, body: Vec<UnitRef>) -> Self
    where
        F: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            evaluator: Arc::new(evaluator),
            body,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn evaluate(&self, ctx: &StepContext) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.evaluator)(ctx))) {
            Ok(passed) => passed,
            Err(panic) => {
                warn!(
                    condition = %self.name,
                    error = %panic_message(&panic),
                    "Evaluator panicked, treating as false"
                );
                false
            }
        }
    }
}

impl Unit for Condition {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Condition
    }

    fn validate(&self) -> Result<()> {
        if self.body.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "condition '{}' has an empty body",
                self.name
            )));
        }
        validate_all(&self.body)
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let passed = self.evaluate(&ctx);
            scope.emit(EventPayload::ConditionStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
                condition_result: passed,
            });

            let mut result = if passed {
                let outcome = run_sequence(&self.body, ctx, scope, &index).await?;
                let mut r = StepResult::new(outcome.last_content());
                r.success = outcome.all_succeeded();
                r.halt = outcome.results.iter().any(StepResult::halt_requested);
                r.children = outcome.results;
                r
            } else {
                debug!(condition = %self.name, "Condition false, skipping body");
                let mut r = StepResult::default();
                r.skipped = true;
                r
            };
            result.step_name = self.name.clone();
            result.kind = UnitKind::Condition;

            scope.emit(EventPayload::ConditionCompleted {
                step_name: self.name.clone(),
                step_index: index,
                condition_result: passed,
                executed_steps: result.children.len(),
            });
            Ok(result)
        })
    }
}

impl From<Condition> for UnitRef {
    fn from(condition: Condition) -> Self {
        Arc::new(condition)
    }
}
