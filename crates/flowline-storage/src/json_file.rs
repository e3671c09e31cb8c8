use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::session::WorkflowSession;
use flowline_core::traits::{SessionFilter, SessionStorage};

/// One pretty-printed JSON file per session: `{dir}/{session_id}.json`.
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id != "."
            && session_id != ".."
            && !session_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(FlowlineError::Storage(format!(
                "session id '{}' cannot be used as a file name",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

async fn read_file(path: &Path) -> Result<Option<WorkflowSession>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let session = serde_json::from_str(&text)
        .map_err(|e| FlowlineError::Storage(format!("{}: {}", path.display(), e)))?;
    Ok(Some(session))
}

impl SessionStorage for JsonFileStorage {
    fn name(&self) -> &str {
        "json"
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            Ok(())
        })
    }

    fn upsert(&self, mut session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>> {
        Box::pin(async move {
            let path = self.path_for(&session.session_id)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            if let Ok(Some(existing)) = read_file(&path).await {
                session.created_at = existing.created_at;
            }
            session.updated_at = Utc::now();

            // Write then rename so a crash never leaves a half-written session.
            let tmp = path.with_extension("json.tmp");
            let text = serde_json::to_string_pretty(&session)?;
            tokio::fs::write(&tmp, text).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(path = %path.display(), "Session written");
            Ok(session)
        })
    }

    fn read(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let session_id = session_id.to_string();
        Box::pin(async move { read_file(&self.path_for(&session_id)?).await })
    }

    fn list_sessions(&self, filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut sessions = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_file(&path).await {
                    Ok(Some(session)) if filter.matches(&session) => sessions.push(session),
                    Ok(_) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
                }
            }
            sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(sessions)
        })
    }

    fn delete(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            match tokio::fs::remove_file(self.path_for(&session_id)?).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
