use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::session::{StoredRun, WorkflowSession};
use flowline_core::traits::{SessionFilter, SessionStorage};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_sessions (
        session_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_name TEXT,
        user_id TEXT,
        session_name TEXT,
        runs TEXT NOT NULL,
        session_data TEXT NOT NULL,
        extra_data TEXT NOT NULL,
        workflow_data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_user
        ON workflow_sessions(user_id, updated_at);

    CREATE INDEX IF NOT EXISTS idx_sessions_workflow
        ON workflow_sessions(workflow_id, updated_at);";

const COLUMNS: &str = "session_id, workflow_id, workflow_name, user_id, session_name, \
     runs, session_data, extra_data, workflow_data, created_at, updated_at";

/// SQLite-backed session storage. Each session is one row; run history and
/// the data maps are JSON text columns.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> FlowlineError {
    FlowlineError::Storage(e.to_string())
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite session storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

/// Raw column values, decoded outside the rusqlite row callback.
struct SessionRow {
    session_id: String,
    workflow_id: String,
    workflow_name: Option<String>,
    user_id: Option<String>,
    session_name: Option<String>,
    runs: String,
    session_data: String,
    extra_data: String,
    workflow_data: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            user_id: row.get(3)?,
            session_name: row.get(4)?,
            runs: row.get(5)?,
            session_data: row.get(6)?,
            extra_data: row.get(7)?,
            workflow_data: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    /// Build the session. Undecodable runs become placeholders, and an
    /// undecodable map column becomes empty; neither fails the read.
    fn into_session(self) -> WorkflowSession {
        let runs = match serde_json::from_str::<Vec<Value>>(&self.runs) {
            Ok(values) => values.into_iter().map(StoredRun::from_value).collect(),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Run history unreadable, dropping it");
                Vec::new()
            }
        };
        WorkflowSession {
            workflow_name: self.workflow_name,
            user_id: self.user_id,
            session_name: self.session_name,
            runs,
            session_data: parse_map(&self.session_id, "session_data", &self.session_data),
            extra_data: parse_map(&self.session_id, "extra_data", &self.extra_data),
            workflow_data: parse_map(&self.session_id, "workflow_data", &self.workflow_data),
            created_at: parse_time(&self.created_at),
            updated_at: parse_time(&self.updated_at),
            session_id: self.session_id,
            workflow_id: self.workflow_id,
        }
    }
}

fn parse_map(session_id: &str, column: &str, text: &str) -> Map<String, Value> {
    serde_json::from_str(text).unwrap_or_else(|e| {
        warn!(session_id = %session_id, column, error = %e, "Column unreadable, using empty map");
        Map::new()
    })
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SessionStorage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock()?.execute_batch(SCHEMA).map_err(db_err)?;
            Ok(())
        })
    }

    fn upsert(&self, mut session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>> {
        Box::pin(async move {
            session.updated_at = Utc::now();
            let runs = Value::Array(session.runs.iter().map(StoredRun::to_value).collect());
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflow_sessions (
                    session_id, workflow_id, workflow_name, user_id, session_name,
                    runs, session_data, extra_data, workflow_data, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(session_id) DO UPDATE SET
                    workflow_id = excluded.workflow_id,
                    workflow_name = excluded.workflow_name,
                    user_id = excluded.user_id,
                    session_name = excluded.session_name,
                    runs = excluded.runs,
                    session_data = excluded.session_data,
                    extra_data = excluded.extra_data,
                    workflow_data = excluded.workflow_data,
                    updated_at = excluded.updated_at",
                params![
                    session.session_id,
                    session.workflow_id,
                    session.workflow_name,
                    session.user_id,
                    session.session_name,
                    runs.to_string(),
                    Value::Object(session.session_data.clone()).to_string(),
                    Value::Object(session.extra_data.clone()).to_string(),
                    Value::Object(session.workflow_data.clone()).to_string(),
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

            let created_at: String = conn
                .query_row(
                    "SELECT created_at FROM workflow_sessions WHERE session_id = ?1",
                    params![session.session_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            session.created_at = parse_time(&created_at);
            Ok(session)
        })
    }

    fn read(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM workflow_sessions WHERE session_id = ?1", COLUMNS),
                    params![session_id],
                    SessionRow::from_row,
                )
                .optional()
                .map_err(db_err)?;
            Ok(row.map(SessionRow::into_session))
        })
    }

    fn list_sessions(&self, filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM workflow_sessions
                     WHERE (?1 IS NULL OR user_id = ?1)
                       AND (?2 IS NULL OR workflow_id = ?2)
                     ORDER BY updated_at DESC",
                    COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![filter.user_id, filter.workflow_id],
                    SessionRow::from_row,
                )
                .map_err(db_err)?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(db_err)?.into_session());
            }
            Ok(sessions)
        })
    }

    fn delete(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.lock()?
                .execute(
                    "DELETE FROM workflow_sessions WHERE session_id = ?1",
                    params![session_id],
                )
                .map_err(db_err)?;
            Ok(())
        })
    }
}
