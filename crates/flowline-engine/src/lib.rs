//! Workflow execution: atomic steps, the five composite primitives, and the
//! engine that runs them against a session.

pub mod condition;
pub mod context;
pub mod definition;
pub mod expr;
pub mod loop_step;
pub mod parallel;
pub mod router;
pub mod run_log;
pub mod scope;
pub mod step;
pub mod steps;
pub mod unit;
pub mod workflow;

pub use condition::Condition;
pub use context::StepContext;
pub use definition::{UnitDef, WorkflowDef};
pub use expr::{evaluate_condition, Expr};
pub use loop_step::{Loop, DEFAULT_MAX_ITERATIONS};
pub use parallel::Parallel;
pub use router::Router;
pub use run_log::RunLogger;
pub use scope::{EventEmitter, RunScope};
pub use step::Step;
pub use steps::Steps;
pub use unit::{Unit, UnitRef};
pub use workflow::{RunEventStream, RunOptions, Workflow, WorkflowBuilder};
