pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowlineError, Result};
pub use event::{EventBus, EventKind, EventPayload, RunEvent, StepIndex};
pub use session::{RunPlaceholder, StoredRun, WorkflowSession};
pub use state::SessionState;
pub use traits::{
    Collaborator, CollaboratorDelta, CollaboratorKind, CollaboratorRequest, CollaboratorResponse,
    SessionFilter, SessionStorage,
};
pub use types::*;
