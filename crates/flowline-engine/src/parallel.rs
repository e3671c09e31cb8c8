use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, info};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::types::{Content, StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::{child_index, RunScope};
use crate::unit::{validate_all, Unit, UnitRef};

/// Concurrent fan-out. Every branch sees the same context; results come back
/// in declaration order.
pub struct Parallel {
    name: String,
    description: Option<String>,
    branches: Vec<UnitRef>,
}

impl Parallel {
    pub fn new(name: impl Into<String>, branches: Vec<UnitRef>) -> Self {
        Self {
            name: name.into(),
            description: None,
            branches,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Unit for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Parallel
    }

    fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "parallel '{}' has no branches",
                self.name
            )));
        }
        validate_all(&self.branches)
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            scope.emit(EventPayload::ParallelStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
                branch_count: self.branches.len(),
            });
            debug!(parallel = %self.name, branches = self.branches.len(), "Parallel started");

            // Every branch starts once the block has started; a halt raised by
            // one branch is only acted on after the join.
            let runs = self.branches.iter().enumerate().map(|(position, branch)| {
                branch.execute(ctx.clone(), scope, child_index(&index, position))
            });

            let mut children = Vec::with_capacity(self.branches.len());
            for outcome in join_all(runs).await {
                children.push(outcome?);
            }

            let mut result = StepResult::new(aggregate_content(&children))
                .with_name(&self.name)
                .with_kind(UnitKind::Parallel);
            result.success = children.iter().all(|c| c.success);
            result.halt = children.iter().any(StepResult::halt_requested);
            result.children = children;

            if result.halt {
                info!(parallel = %self.name, "Branch requested halt");
            }

            scope.emit(EventPayload::ParallelCompleted {
                step_name: self.name.clone(),
                step_index: index,
                branch_count: self.branches.len(),
                result: result.clone(),
            });
            Ok(result)
        })
    }
}

impl From<Parallel> for UnitRef {
    fn from(parallel: Parallel) -> Self {
        Arc::new(parallel)
    }
}

/// Join branch content. One branch passes through unchanged.
fn aggregate_content(children: &[StepResult]) -> Content {
    match children {
        [] => Content::empty(),
        [only] => only.content.clone(),
        many => {
            let sections: Vec<String> = many
                .iter()
                .map(|c| {
                    let status = if c.success { "SUCCESS" } else { "FAILURE" };
                    let body = if c.content.is_empty() {
                        "*(No content)*".to_string()
                    } else {
                        c.content.to_text()
                    };
                    format!("### {}: {}\n{}", status, c.step_name, body)
                })
                .collect();
            Content::Text(format!(
                "## Parallel Execution Results\n\n{}",
                sections.join("\n\n")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_single_branch_passes_through() {
        let only = StepResult::new(serde_json::json!({"k": 1})).with_name("a");
        assert_eq!(
            aggregate_content(&[only]),
            Content::Structured(serde_json::json!({"k": 1}))
        );
    }

    #[test]
    fn test_aggregate_many_branches() {
        let children = vec![
            StepResult::new("alpha").with_name("a"),
            StepResult::failure("broke").with_name("b"),
            StepResult::new("").with_name("c"),
        ];
        let text = aggregate_content(&children).to_text();
        assert_eq!(
            text,
            "## Parallel Execution Results\n\n\
             ### SUCCESS: a\nalpha\n\n\
             ### FAILURE: b\nbroke\n\n\
             ### SUCCESS: c\n*(No content)*"
        );
    }

    #[test]
    fn test_aggregate_keeps_whitespace_content() {
        let children = vec![
            StepResult::new("  ").with_name("a"),
            StepResult::new("").with_name("b"),
        ];
        let text = aggregate_content(&children).to_text();
        assert!(text.contains("### SUCCESS: a\n  \n\n"));
        assert!(text.ends_with("### SUCCESS: b\n*(No content)*"));
    }
}
