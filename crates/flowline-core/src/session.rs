use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::types::{RunStatus, WorkflowRunResponse};

/// Key under `session_data` holding the persisted session state.
pub const SESSION_STATE_KEY: &str = "session_state";

/// Minimal record kept for a run that could not be (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlaceholder {
    pub run_id: String,
    pub status: String,
    pub error: String,
}

/// One entry of a session's run history.
///
/// Never fails to serialize or deserialize: a run that does not survive the
/// trip degrades to a [`RunPlaceholder`] instead of poisoning the session.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRun {
    Complete(Box<WorkflowRunResponse>),
    Placeholder(RunPlaceholder),
}

impl StoredRun {
    pub fn run_id(&self) -> &str {
        match self {
            StoredRun::Complete(r) => &r.run_id,
            StoredRun::Placeholder(p) => &p.run_id,
        }
    }

    pub fn status(&self) -> String {
        match self {
            StoredRun::Complete(r) => r.status.to_string(),
            StoredRun::Placeholder(p) => p.status.clone(),
        }
    }

    pub fn response(&self) -> Option<&WorkflowRunResponse> {
        match self {
            StoredRun::Complete(r) => Some(r),
            StoredRun::Placeholder(_) => None,
        }
    }

    /// Decode a stored value, degrading to a placeholder on failure.
    pub fn from_value(value: Value) -> Self {
        let run_id = value
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        if value.get("error").is_some() && value.get("workflow_id").is_none() {
            if let Ok(placeholder) = serde_json::from_value::<RunPlaceholder>(value.clone()) {
                return StoredRun::Placeholder(placeholder);
            }
        }

        match serde_json::from_value::<WorkflowRunResponse>(value) {
            Ok(resp) => StoredRun::Complete(Box::new(resp)),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to decode stored run, keeping placeholder");
                StoredRun::Placeholder(RunPlaceholder {
                    run_id,
                    status,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Encode for storage, degrading to a placeholder on failure.
    pub fn to_value(&self) -> Value {
        let placeholder = match self {
            StoredRun::Complete(resp) => match serde_json::to_value(resp.as_ref()) {
                Ok(v) => return v,
                Err(e) => {
                    warn!(run_id = %resp.run_id, error = %e, "Failed to encode run, storing placeholder");
                    RunPlaceholder {
                        run_id: resp.run_id.clone(),
                        status: resp.status.to_string(),
                        error: e.to_string(),
                    }
                }
            },
            StoredRun::Placeholder(p) => p.clone(),
        };
        serde_json::json!({
            "run_id": placeholder.run_id,
            "status": placeholder.status,
            "error": placeholder.error,
        })
    }
}

impl From<WorkflowRunResponse> for StoredRun {
    fn from(resp: WorkflowRunResponse) -> Self {
        StoredRun::Complete(Box::new(resp))
    }
}

impl Serialize for StoredRun {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StoredRun {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(StoredRun::from_value(value))
    }
}

/// The persisted unit of history for one workflow + session identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    /// Run history, oldest first.
    #[serde(default)]
    pub runs: Vec<StoredRun>,
    #[serde(default)]
    pub session_data: Map<String, Value>,
    #[serde(default)]
    pub extra_data: Map<String, Value>,
    #[serde(default)]
    pub workflow_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(session_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: None,
            user_id: None,
            session_name: None,
            runs: Vec::new(),
            session_data: Map::new(),
            extra_data: Map::new(),
            workflow_data: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a run, or replace the entry with the same run id.
    pub fn upsert_run(&mut self, run: WorkflowRunResponse) {
        self.updated_at = Utc::now();
        if let Some(existing) = self.runs.iter_mut().find(|r| r.run_id() == run.run_id) {
            *existing = run.into();
        } else {
            self.runs.push(run.into());
        }
    }

    pub fn get_run(&self, run_id: &str) -> Option<&StoredRun> {
        self.runs.iter().find(|r| r.run_id() == run_id)
    }

    pub fn last_run(&self) -> Option<&StoredRun> {
        self.runs.last()
    }

    /// Number of runs that ended in the given status.
    pub fn count_with_status(&self, status: RunStatus) -> usize {
        let wanted = status.to_string();
        self.runs.iter().filter(|r| r.status() == wanted).count()
    }

    pub fn session_state(&self) -> Option<&Map<String, Value>> {
        self.session_data
            .get(SESSION_STATE_KEY)
            .and_then(Value::as_object)
    }

    pub fn set_session_state(&mut self, state: Map<String, Value>) {
        self.session_data
            .insert(SESSION_STATE_KEY.to_string(), Value::Object(state));
    }

    /// Set the display name, mirrored into the `session_name` state key.
    pub fn rename(&mut self, session_name: impl Into<String>) {
        let session_name = session_name.into();
        let mut state = self.session_state().cloned().unwrap_or_default();
        state.insert(
            "session_name".to_string(),
            Value::String(session_name.clone()),
        );
        self.set_session_state(state);
        self.session_name = Some(session_name);
        self.updated_at = Utc::now();
    }
}
