use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::types::{StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::RunScope;
use crate::step::panic_message;
use crate::unit::{run_sequence, validate_all, Unit, UnitRef};

/// Picks candidate names, in the order they should run.
pub type Selector = Arc<dyn Fn(&StepContext) -> Vec<String> + Send + Sync>;

/// Input-dependent selection among a fixed set of candidate units.
///
/// The selector is called once per invocation. Selected candidates run as a
/// sequence; the rest are never touched. Selecting a name outside the declared
/// candidates is an engine fault.
pub struct Router {
    name: String,
    description: Option<String>,
    selector: Selector,
    choices: Vec<UnitRef>,
}

impl Router {
    pub fn new<F>(name: impl Into<String>, selector: F, choices: Vec<UnitRef>) -> Self
    where
        F: Fn(&StepContext) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            selector: Arc::new(selector),
            choices,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn choice_names(&self) -> Vec<&str> {
        self.choices.iter().map(|c| c.name()).collect()
    }

    fn resolve(&self, selected: &[String]) -> Result<Vec<UnitRef>> {
        selected
            .iter()
            .map(|name| {
                self.choices
                    .iter()
                    .find(|c| c.name() == name.as_str())
                    .cloned()
                    .ok_or_else(|| FlowlineError::UnknownRoute {
                        router: self.name.clone(),
                        selected: name.clone(),
                    })
            })
            .collect()
    }
}

impl Unit for Router {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Router
    }

    fn validate(&self) -> Result<()> {
        if self.choices.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "router '{}' declares no choices",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for choice in &self.choices {
            if !seen.insert(choice.name()) {
                return Err(FlowlineError::InvalidWorkflow(format!(
                    "router '{}' declares choice '{}' more than once",
                    self.name,
                    choice.name()
                )));
            }
        }
        validate_all(&self.choices)
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            let selected = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.selector)(&ctx))) {
                Ok(names) => names,
                Err(panic) => {
                    let message = format!("selector panicked: {}", panic_message(&panic));
                    error!(router = %self.name, error = %message, "Router selector failed");
                    return Ok(StepResult::failure(message)
                        .with_name(&self.name)
                        .with_kind(UnitKind::Router));
                }
            };

            let units = match self.resolve(&selected) {
                Ok(units) => units,
                Err(e) => {
                    error!(router = %self.name, error = %e, "Router selected an undeclared unit");
                    return Err(e);
                }
            };

            scope.emit(EventPayload::RouterStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
                selected_steps: selected.clone(),
            });
            debug!(router = %self.name, selected = ?selected, "Router selected units");

            let outcome = run_sequence(&units, ctx, scope, &index).await?;
            let mut result = StepResult::new(outcome.last_content())
                .with_name(&self.name)
                .with_kind(UnitKind::Router);
            result.success = outcome.all_succeeded();
            result.halt = outcome.results.iter().any(StepResult::halt_requested);
            result.children = outcome.results;

            scope.emit(EventPayload::RouterCompleted {
                step_name: self.name.clone(),
                step_index: index,
                selected_steps: selected,
                executed_steps: result.children.len(),
            });
            Ok(result)
        })
    }
}

impl From<Router> for UnitRef {
    fn from(router: Router) -> Self {
        Arc::new(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::state::SessionState;
    use flowline_core::types::{Content, WorkflowInput};
    use tokio::sync::Semaphore;

    use crate::scope::EventEmitter;
    use crate::step::Step;

    fn scope() -> RunScope {
        RunScope::new(
            "run",
            "sess",
            "wf",
            SessionState::new(),
            EventEmitter::disabled(),
            Arc::new(Semaphore::new(2)),
        )
    }

    fn ctx(input: &str) -> StepContext {
        StepContext::new(WorkflowInput::new(input), SessionState::new(), "sess", None)
    }

    fn choice(name: &'static str) -> UnitRef {
        Step::blocking(name, move |_| Ok(StepResult::new(name))).into()
    }

    #[tokio::test]
    async fn test_runs_selection_in_order() {
        let router = Router::new(
            "r",
            |_: &StepContext| vec!["b".to_string(), "a".to_string()],
            vec![choice("a"), choice("b"), choice("c")],
        );
        let s = scope();
        let r = router.execute(ctx("x"), &s, vec![0]).await.unwrap();
        let names: Vec<_> = r.children.iter().map(|c| c.step_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(r.content, Content::text("a"));
    }

    #[tokio::test]
    async fn test_undeclared_selection_is_engine_fault() {
        let router = Router::new(
            "r",
            |_: &StepContext| vec!["zzz".to_string()],
            vec![choice("a")],
        );
        let s = scope();
        let err = router.execute(ctx("x"), &s, vec![0]).await.unwrap_err();
        assert!(matches!(err, FlowlineError::UnknownRoute { .. }));
        assert!(err.is_engine_fault());
    }

    #[test]
    fn test_duplicate_choices_rejected() {
        let router = Router::new("r", |_: &StepContext| vec![], vec![choice("a"), choice("a")]);
        assert!(router.validate().is_err());
        assert_eq!(
            Router::new("r", |_: &StepContext| vec![], vec![choice("a")]).choice_names(),
            vec!["a"]
        );
    }
}
