use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use futures::future::BoxFuture;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::session::WorkflowSession;
use flowline_core::traits::{SessionFilter, SessionStorage};

/// Process-local storage. Contents are lost on exit.
#[derive(Default)]
pub struct InMemoryStorage {
    sessions: Mutex<HashMap<String, WorkflowSession>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, WorkflowSession>>> {
        self.sessions
            .lock()
            .map_err(|e| FlowlineError::Storage(e.to_string()))
    }
}

impl SessionStorage for InMemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn upsert(&self, mut session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>> {
        Box::pin(async move {
            let mut sessions = self.lock()?;
            if let Some(existing) = sessions.get(&session.session_id) {
                session.created_at = existing.created_at;
            }
            session.updated_at = Utc::now();
            sessions.insert(session.session_id.clone(), session.clone());
            Ok(session)
        })
    }

    fn read(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let session_id = session_id.to_string();
        Box::pin(async move { Ok(self.lock()?.get(&session_id).cloned()) })
    }

    fn list_sessions(&self, filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        Box::pin(async move {
            let mut sessions: Vec<_> = self
                .lock()?
                .values()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect();
            sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(sessions)
        })
    }

    fn delete(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.lock()?.remove(&session_id);
            Ok(())
        })
    }
}
