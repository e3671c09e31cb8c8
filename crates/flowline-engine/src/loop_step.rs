use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::types::{StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::RunScope;
use crate::step::panic_message;
use crate::unit::{run_sequence, validate_all, Unit, UnitRef};

/// Decides, from one iteration's results, whether the loop is done.
pub type EndCondition = Arc<dyn Fn(&[StepResult]) -> bool + Send + Sync>;

pub const DEFAULT_MAX_ITERATIONS: usize = 3;

/// Bounded repetition of a body.
///
/// Each iteration sees the context as of loop entry plus everything earlier
/// iterations recorded. `children` holds one `Iteration` result per pass.
pub struct Loop {
    name: String,
    description: Option<String>,
    body: Vec<UnitRef>,
    end_condition: Option<EndCondition>,
    max_iterations: usize,
}

impl Loop {
    pub fn new(name: impl Into<String>, body: Vec<UnitRef>) -> Self {
        Self {
            name: name.into(),
            description: None,
            body,
            end_condition: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_end_condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&[StepResult]) -> bool + Send + Sync + 'static,
    {
        self.end_condition = Some(Arc::new(f));
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    fn should_end(&self, results: &[StepResult]) -> bool {
        let Some(cond) = &self.end_condition else {
            return false;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| cond(results))) {
            Ok(done) => done,
            Err(panic) => {
                warn!(
                    loop_name = %self.name,
                    error = %panic_message(&panic),
                    "End condition panicked, continuing loop"
                );
                false
            }
        }
    }
}

impl Unit for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Loop
    }

    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "loop '{}' must allow at least one iteration",
                self.name
            )));
        }
        if self.body.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "loop '{}' has an empty body",
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
            if self.max_iterations == 0 {
                return Err(FlowlineError::InvalidWorkflow(format!(
                    "loop '{}' must allow at least one iteration",
                    self.name
                )));
            }

            scope.emit(EventPayload::LoopStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
                max_iterations: self.max_iterations,
            });

            let mut iter_ctx = ctx;
            let mut iterations: Vec<StepResult> = Vec::new();

            for iteration in 1..=self.max_iterations {
                if scope.is_halted() {
                    break;
                }
                scope.emit(EventPayload::LoopIterationStarted {
                    step_name: self.name.clone(),
                    step_index: index.clone(),
                    iteration,
                    max_iterations: self.max_iterations,
                });

                let outcome = run_sequence(&self.body, iter_ctx, scope, &index).await?;
                let halted = outcome.halted;
                let ended = !halted && self.should_end(&outcome.results);

                let mut pass = StepResult::new(outcome.last_content())
                    .with_name(format!("{}#{}", self.name, iteration))
                    .with_kind(UnitKind::Iteration);
                pass.success = outcome.all_succeeded();
                pass.halt = outcome.results.iter().any(StepResult::halt_requested);
                pass.children = outcome.results;
                iter_ctx = outcome.context;

                let should_continue = !halted && !ended && iteration < self.max_iterations;
                scope.emit(EventPayload::LoopIterationCompleted {
                    step_name: self.name.clone(),
                    step_index: index.clone(),
                    iteration,
                    max_iterations: self.max_iterations,
                    should_continue,
                });
                iterations.push(pass);

                if halted {
                    info!(loop_name = %self.name, iteration, "Loop stopped by halt");
                    break;
                }
                if ended {
                    debug!(loop_name = %self.name, iteration, "End condition met");
                    break;
                }
                if iteration == self.max_iterations {
                    debug!(loop_name = %self.name, "Loop reached max iterations");
                }
            }

            let mut result = StepResult::new(
                iterations
                    .last()
                    .map(|p| p.content.clone())
                    .unwrap_or_default(),
            )
            .with_name(&self.name)
            .with_kind(UnitKind::Loop);
            result.success = iterations.iter().all(|p| p.success);
            result.halt = iterations.iter().any(|p| p.halt);
            result.children = iterations;

            scope.emit(EventPayload::LoopCompleted {
                step_name: self.name.clone(),
                step_index: index,
                total_iterations: result.children.len(),
            });
            Ok(result)
        })
    }
}

impl From<Loop> for UnitRef {
    fn from(l: Loop) -> Self {
        Arc::new(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::state::SessionState;
    use flowline_core::types::WorkflowInput;
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

    fn ctx() -> StepContext {
        StepContext::new(WorkflowInput::new("x"), SessionState::new(), "sess", None)
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let l = Loop::new("l", vec![Step::blocking("s", |_| Ok(StepResult::new("x"))).into()])
            .with_max_iterations(0);
        assert!(matches!(l.validate(), Err(FlowlineError::InvalidWorkflow(_))));
    }

    #[tokio::test]
    async fn test_zero_iterations_fail_on_first_use() {
        let l = Loop::new("l", vec![Step::blocking("s", |_| Ok(StepResult::new("x"))).into()])
            .with_max_iterations(0);
        let s = scope();
        assert!(l.execute(ctx(), &s, vec![0]).await.is_err());
    }

    #[tokio::test]
    async fn test_later_iterations_see_earlier_ones() {
        let body = Step::from_fn("count", |ctx: StepContext| async move {
            let prev = ctx
                .get_step_content("count")
                .map(|c| c.to_text().parse::<u32>().unwrap_or(0))
                .unwrap_or(0);
            Ok(StepResult::new((prev + 1).to_string()))
        });
        let l = Loop::new("l", vec![body.into()]).with_max_iterations(4);
        let s = scope();
        let r = l.execute(ctx(), &s, vec![0]).await.unwrap();
        assert_eq!(r.children.len(), 4);
        assert_eq!(r.content.to_text(), "4");
        assert_eq!(r.children[1].step_name, "l#2");
        assert_eq!(r.children[1].kind, UnitKind::Iteration);
    }

    #[tokio::test]
    async fn test_panicking_end_condition_is_ignored() {
        let l = Loop::new("l", vec![Step::blocking("s", |_| Ok(StepResult::new("x"))).into()])
            .with_max_iterations(2)
            .with_end_condition(|_| panic!("bad predicate"));
        let s = scope();
        let r = l.execute(ctx(), &s, vec![0]).await.unwrap();
        assert_eq!(r.children.len(), 2);
    }
}
