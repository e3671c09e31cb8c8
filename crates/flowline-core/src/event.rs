use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FlowlineError;
use crate::types::{Content, RunStatus, StepResult};

/// Position of a unit in the workflow tree: one index per nesting level.
pub type StepIndex = Vec<usize>;

/// A single event emitted while a workflow runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub session_id: String,
    pub workflow_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Kind-specific event fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_name: Option<String>,
    },
    WorkflowCompleted {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Content>,
        step_count: usize,
    },
    WorkflowError {
        error: String,
    },
    StepStarted {
        step_name: String,
        step_index: StepIndex,
    },
    StepCompleted {
        step_name: String,
        step_index: StepIndex,
        result: StepResult,
    },
    StepsStarted {
        step_name: String,
        step_index: StepIndex,
        steps_count: usize,
    },
    StepsCompleted {
        step_name: String,
        step_index: StepIndex,
        executed_steps: usize,
    },
    ParallelStarted {
        step_name: String,
        step_index: StepIndex,
        branch_count: usize,
    },
    ParallelCompleted {
        step_name: String,
        step_index: StepIndex,
        branch_count: usize,
        result: StepResult,
    },
    LoopStarted {
        step_name: String,
        step_index: StepIndex,
        max_iterations: usize,
    },
    LoopIterationStarted {
        step_name: String,
        step_index: StepIndex,
        iteration: usize,
        max_iterations: usize,
    },
    LoopIterationCompleted {
        step_name: String,
        step_index: StepIndex,
        iteration: usize,
        max_iterations: usize,
        should_continue: bool,
    },
    LoopCompleted {
        step_name: String,
        step_index: StepIndex,
        total_iterations: usize,
    },
    ConditionStarted {
        step_name: String,
        step_index: StepIndex,
        condition_result: bool,
    },
    ConditionCompleted {
        step_name: String,
        step_index: StepIndex,
        condition_result: bool,
        executed_steps: usize,
    },
    RouterStarted {
        step_name: String,
        step_index: StepIndex,
        selected_steps: Vec<String>,
    },
    RouterCompleted {
        step_name: String,
        step_index: StepIndex,
        selected_steps: Vec<String>,
        executed_steps: usize,
    },
    ContentDelta {
        step_name: String,
        step_index: StepIndex,
        delta: Content,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            EventPayload::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            EventPayload::WorkflowError { .. } => EventKind::WorkflowError,
            EventPayload::StepStarted { .. } => EventKind::StepStarted,
            EventPayload::StepCompleted { .. } => EventKind::StepCompleted,
            EventPayload::StepsStarted { .. } => EventKind::StepsStarted,
            EventPayload::StepsCompleted { .. } => EventKind::StepsCompleted,
            EventPayload::ParallelStarted { .. } => EventKind::ParallelStarted,
            EventPayload::ParallelCompleted { .. } => EventKind::ParallelCompleted,
            EventPayload::LoopStarted { .. } => EventKind::LoopStarted,
            EventPayload::LoopIterationStarted { .. } => EventKind::LoopIterationStarted,
            EventPayload::LoopIterationCompleted { .. } => EventKind::LoopIterationCompleted,
            EventPayload::LoopCompleted { .. } => EventKind::LoopCompleted,
            EventPayload::ConditionStarted { .. } => EventKind::ConditionStarted,
            EventPayload::ConditionCompleted { .. } => EventKind::ConditionCompleted,
            EventPayload::RouterStarted { .. } => EventKind::RouterStarted,
            EventPayload::RouterCompleted { .. } => EventKind::RouterCompleted,
            EventPayload::ContentDelta { .. } => EventKind::ContentDelta,
        }
    }

    /// Name of the unit this event belongs to, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            EventPayload::WorkflowStarted { .. }
            | EventPayload::WorkflowCompleted { .. }
            | EventPayload::WorkflowError { .. } => None,
            EventPayload::StepStarted { step_name, .. }
            | EventPayload::StepCompleted { step_name, .. }
            | EventPayload::StepsStarted { step_name, .. }
            | EventPayload::StepsCompleted { step_name, .. }
            | EventPayload::ParallelStarted { step_name, .. }
            | EventPayload::ParallelCompleted { step_name, .. }
            | EventPayload::LoopStarted { step_name, .. }
            | EventPayload::LoopIterationStarted { step_name, .. }
            | EventPayload::LoopIterationCompleted { step_name, .. }
            | EventPayload::LoopCompleted { step_name, .. }
            | EventPayload::ConditionStarted { step_name, .. }
            | EventPayload::ConditionCompleted { step_name, .. }
            | EventPayload::RouterStarted { step_name, .. }
            | EventPayload::RouterCompleted { step_name, .. }
            | EventPayload::ContentDelta { step_name, .. } => Some(step_name),
        }
    }
}

/// Event discriminant, used to suppress kinds from the stream and the stored log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowError,
    StepStarted,
    StepCompleted,
    StepsStarted,
    StepsCompleted,
    ParallelStarted,
    ParallelCompleted,
    LoopStarted,
    LoopIterationStarted,
    LoopIterationCompleted,
    LoopCompleted,
    ConditionStarted,
    ConditionCompleted,
    RouterStarted,
    RouterCompleted,
    ContentDelta,
}

impl EventKind {
    pub const ALL: [EventKind; 18] = [
        EventKind::WorkflowStarted,
        EventKind::WorkflowCompleted,
        EventKind::WorkflowError,
        EventKind::StepStarted,
        EventKind::StepCompleted,
        EventKind::StepsStarted,
        EventKind::StepsCompleted,
        EventKind::ParallelStarted,
        EventKind::ParallelCompleted,
        EventKind::LoopStarted,
        EventKind::LoopIterationStarted,
        EventKind::LoopIterationCompleted,
        EventKind::LoopCompleted,
        EventKind::ConditionStarted,
        EventKind::ConditionCompleted,
        EventKind::RouterStarted,
        EventKind::RouterCompleted,
        EventKind::ContentDelta,
    ];

    /// Unit-structure events, only delivered when intermediate steps are streamed.
    pub fn is_intermediate(&self) -> bool {
        !matches!(
            self,
            EventKind::WorkflowStarted
                | EventKind::WorkflowCompleted
                | EventKind::WorkflowError
                | EventKind::ContentDelta
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowError => "workflow_error",
            EventKind::StepStarted => "step_started",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepsStarted => "steps_started",
            EventKind::StepsCompleted => "steps_completed",
            EventKind::ParallelStarted => "parallel_started",
            EventKind::ParallelCompleted => "parallel_completed",
            EventKind::LoopStarted => "loop_started",
            EventKind::LoopIterationStarted => "loop_iteration_started",
            EventKind::LoopIterationCompleted => "loop_iteration_completed",
            EventKind::LoopCompleted => "loop_completed",
            EventKind::ConditionStarted => "condition_started",
            EventKind::ConditionCompleted => "condition_completed",
            EventKind::RouterStarted => "router_started",
            EventKind::RouterCompleted => "router_completed",
            EventKind::ContentDelta => "content_delta",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FlowlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| FlowlineError::Config(format!("Unknown event kind: {}", s)))
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
