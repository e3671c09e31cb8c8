use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::Result;
use flowline_core::event::StepIndex;
use flowline_core::types::{StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::{child_index, RunScope};

/// Anything the engine can execute: an atomic step or a composite primitive.
///
/// `execute` resolves to `Err` only for engine faults (a misconfigured
/// composition). Unit failures and halts are carried in the returned
/// [`StepResult`].
pub trait Unit: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn kind(&self) -> UnitKind;

    /// Static checks run once when the workflow is built.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>>;
}

pub type UnitRef = Arc<dyn Unit>;

/// Outcome of running a list of units one after another.
pub(crate) struct SequenceOutcome {
    pub results: Vec<StepResult>,
    pub context: StepContext,
    pub halted: bool,
}

impl SequenceOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// Content of the last unit that actually ran.
    pub fn last_content(&self) -> flowline_core::types::Content {
        self.results
            .iter()
            .rev()
            .find(|r| !r.skipped)
            .map(|r| r.content.clone())
            .unwrap_or_default()
    }
}

/// Run `units` in order, threading the context from each into the next.
///
/// Stops before the next unit once the run is halted.
pub(crate) async fn run_sequence(
    units: &[UnitRef],
    mut ctx: StepContext,
    scope: &RunScope,
    parent: &StepIndex,
) -> Result<SequenceOutcome> {
    let mut results = Vec::with_capacity(units.len());
    for (position, unit) in units.iter().enumerate() {
        if scope.is_halted() {
            debug!(step = %unit.name(), "Run halted, not starting unit");
            return Ok(SequenceOutcome {
                results,
                context: ctx,
                halted: true,
            });
        }

        let result = unit
            .execute(ctx.clone(), scope, child_index(parent, position))
            .await?;
        ctx.record(&result);
        let halted = result.halt_requested();
        results.push(result);

        if halted {
            return Ok(SequenceOutcome {
                results,
                context: ctx,
                halted: true,
            });
        }
    }

    Ok(SequenceOutcome {
        results,
        context: ctx,
        halted: scope.is_halted(),
    })
}

/// Validate every unit, failing on the first fault.
pub(crate) fn validate_all(units: &[UnitRef]) -> Result<()> {
    units.iter().try_for_each(|u| u.validate())
}
