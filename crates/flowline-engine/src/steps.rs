use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::types::{StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::RunScope;
use crate::unit::{run_sequence, validate_all, Unit, UnitRef};

/// A named sub-sequence. Later units can address its output by its own name.
pub struct Steps {
    name: String,
    description: Option<String>,
    units: Vec<UnitRef>,
}

impl Steps {
    pub fn new(name: impl Into<String>, units: Vec<UnitRef>) -> Self {
        Self {
            name: name.into(),
            description: None,
            units,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Unit for Steps {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Steps
    }

    fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "steps '{}' has no units",
                self.name
            )));
        }
        validate_all(&self.units)
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            scope.emit(EventPayload::StepsStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
                steps_count: self.units.len(),
            });

            let outcome = run_sequence(&self.units, ctx, scope, &index).await?;
            debug!(steps = %self.name, executed = outcome.results.len(), "Steps finished");

            let mut result = StepResult::new(outcome.last_content())
                .with_name(&self.name)
                .with_kind(UnitKind::Steps);
            result.success = outcome.all_succeeded();
            result.halt = outcome.results.iter().any(StepResult::halt_requested);
            result.children = outcome.results;

            scope.emit(EventPayload::StepsCompleted {
                step_name: self.name.clone(),
                step_index: index,
                executed_steps: result.children.len(),
            });
            Ok(result)
        })
    }
}

impl From<Steps> for UnitRef {
    fn from(steps: Steps) -> Self {
        Arc::new(steps)
    }
}
