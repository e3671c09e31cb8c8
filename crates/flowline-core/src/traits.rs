use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::session::WorkflowSession;
use crate::state::SessionState;
use crate::types::{Content, UnitKind};

/// Whether a collaborator is a single agent or a team of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollaboratorKind {
    #[default]
    Agent,
    Team,
}

impl CollaboratorKind {
    pub fn unit_kind(&self) -> UnitKind {
        match self {
            CollaboratorKind::Agent => UnitKind::Agent,
            CollaboratorKind::Team => UnitKind::Team,
        }
    }
}

/// What a step hands to its collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorRequest {
    /// Previous unit's content, or the workflow input for the first unit.
    pub input: Content,
    pub session_id: String,
    pub user_id: Option<String>,
    pub session_state: SessionState,
    pub additional_data: Option<Map<String, Value>>,
}

/// A collaborator's final answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaboratorResponse {
    pub content: Content,
    pub metrics: Option<Value>,
}

impl CollaboratorResponse {
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            metrics: None,
        }
    }
}

/// One element of a streamed collaborator run.
#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorDelta {
    /// A partial chunk, relayed to the caller unchanged.
    Content(Content),
    /// The final response. When absent, the chunks are concatenated instead.
    Done(CollaboratorResponse),
}

/// External agent or team that a step delegates to.
pub trait Collaborator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> CollaboratorKind {
        CollaboratorKind::Agent
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// Run to completion and return the final response.
    fn invoke(&self, request: CollaboratorRequest) -> BoxFuture<'_, Result<CollaboratorResponse>>;

    /// Run in streaming mode. Defaults to a single `Done` element.
    fn invoke_stream(
        &self,
        request: CollaboratorRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<CollaboratorDelta>>>> {
        Box::pin(async move {
            let response = self.invoke(request).await?;
            let stream: BoxStream<'_, Result<CollaboratorDelta>> = Box::pin(
                futures::stream::once(async move { Ok(CollaboratorDelta::Done(response)) }),
            );
            Ok(stream)
        })
    }
}

/// Filter for listing sessions. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, session: &WorkflowSession) -> bool {
        let user_ok = match &self.user_id {
            Some(u) => session.user_id.as_deref() == Some(u.as_str()),
            None => true,
        };
        let workflow_ok = match &self.workflow_id {
            Some(w) => session.workflow_id == *w,
            None => true,
        };
        user_ok && workflow_ok
    }
}

/// Persistence backend for workflow sessions.
pub trait SessionStorage: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Prepare the backing store (tables, directories). Idempotent.
    fn create(&self) -> BoxFuture<'_, Result<()>>;

    /// Insert or replace a session, returning what was stored.
    fn upsert(&self, session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>>;

    /// Load a session by id.
    fn read(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>>;

    /// List sessions, newest first.
    fn list_sessions(&self, filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>>;

    /// Delete a session. Deleting a missing session is not an error.
    fn delete(&self, session_id: &str) -> BoxFuture<'_, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let mut s = WorkflowSession::new("s1", "wf-a");
        s.user_id = Some("alice".into());

        assert!(SessionFilter::default().matches(&s));
        assert!(SessionFilter {
            user_id: Some("alice".into()),
            workflow_id: Some("wf-a".into()),
        }
        .matches(&s));
        assert!(!SessionFilter {
            user_id: Some("bob".into()),
            workflow_id: None,
        }
        .matches(&s));
        assert!(!SessionFilter {
            user_id: None,
            workflow_id: Some("wf-b".into()),
        }
        .matches(&s));
    }

    #[test]
    fn test_collaborator_kind_maps_to_unit_kind() {
        assert_eq!(CollaboratorKind::Agent.unit_kind(), UnitKind::Agent);
        assert_eq!(CollaboratorKind::Team.unit_kind(), UnitKind::Team);
    }
}
