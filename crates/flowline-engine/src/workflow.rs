use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowline_core::config::EngineConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventBus, EventKind, EventPayload, RunEvent};
use flowline_core::session::{StoredRun, WorkflowSession};
use flowline_core::state::SessionState;
use flowline_core::traits::{SessionFilter, SessionStorage};
use flowline_core::types::{
    Content, RunStatus, StepResult, WorkflowInput, WorkflowMetrics, WorkflowRunResponse,
};

use crate::context::StepContext;
use crate::scope::{EventEmitter, RunScope};
use crate::unit::{run_sequence, validate_all, UnitRef};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse (or create) this session. A fresh id is generated when absent.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Overrides the engine setting for this run.
    pub stream_intermediate_steps: Option<bool>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn intermediate_steps(mut self, enabled: bool) -> Self {
        self.stream_intermediate_steps = Some(enabled);
        self
    }
}

pub struct WorkflowBuilder {
    name: String,
    workflow_id: Option<String>,
    description: Option<String>,
    units: Vec<UnitRef>,
    initial_state: Map<String, Value>,
    storage: Option<Arc<dyn SessionStorage>>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl WorkflowBuilder {
    pub fn workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<UnitRef>) -> Self {
        self.units.push(unit.into());
        self
    }

    pub fn units(mut self, units: impl IntoIterator<Item = UnitRef>) -> Self {
        self.units.extend(units);
        self
    }

    pub fn initial_state(mut self, state: Map<String, Value>) -> Self {
        self.initial_state = state;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store_events(mut self, enabled: bool) -> Self {
        self.config.store_events = enabled;
        self
    }

    pub fn skip_events(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.config.events_to_skip.extend(kinds);
        self
    }

    pub fn stream_intermediate_steps(mut self, enabled: bool) -> Self {
        self.config.stream_intermediate_steps = enabled;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validate the unit tree and build the workflow.
    pub fn build(self) -> Result<Workflow> {
        if self.units.is_empty() {
            return Err(FlowlineError::InvalidWorkflow(format!(
                "workflow '{}' has no units",
                self.name
            )));
        }
        if self.config.max_blocking_workers == 0 {
            return Err(FlowlineError::InvalidWorkflow(
                "max_blocking_workers must be at least 1".into(),
            ));
        }
        validate_all(&self.units)?;

        let workflow_id = self
            .workflow_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Workflow {
            name: self.name,
            workflow_id,
            description: self.description,
            units: self.units,
            initial_state: self.initial_state,
            storage: self.storage,
            blocking: Arc::new(Semaphore::new(self.config.max_blocking_workers)),
            config: self.config,
            event_bus: self.event_bus,
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

/// A named, fixed list of top-level units that can be run many times.
///
/// Each run threads a [`StepContext`] through the units in order, stops at
/// the first halt, and appends a [`WorkflowRunResponse`] to the session's
/// history. Storage faults never fail a run: the session falls back to an
/// in-process copy.
pub struct Workflow {
    name: String,
    workflow_id: String,
    description: Option<String>,
    units: Vec<UnitRef>,
    initial_state: Map<String, Value>,
    storage: Option<Arc<dyn SessionStorage>>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    blocking: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, WorkflowSession>>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            workflow_id: None,
            description: None,
            units: Vec::new(),
            initial_state: Map::new(),
            storage: None,
            config: EngineConfig::default(),
            event_bus: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn units(&self) -> &[UnitRef] {
        &self.units
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run to completion.
    ///
    /// Returns `Err` only for engine faults; the failed run is still recorded
    /// in the session history.
    pub async fn run(
        &self,
        input: impl Into<WorkflowInput>,
        options: RunOptions,
    ) -> Result<WorkflowRunResponse> {
        self.execute_run(input.into(), options, None).await
    }

    /// Run in the background and stream events as they happen.
    ///
    /// Collaborators are invoked in streaming mode and their chunks are
    /// forwarded as content deltas.
    pub fn run_stream(
        self: &Arc<Self>,
        input: impl Into<WorkflowInput>,
        options: RunOptions,
    ) -> RunEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let workflow = Arc::clone(self);
        let input = input.into();
        let handle =
            tokio::spawn(async move { workflow.execute_run(input, options, Some(tx)).await });
        RunEventStream {
            rx,
            handle: Some(handle),
        }
    }

    async fn execute_run(
        &self,
        input: WorkflowInput,
        options: RunOptions,
        live: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Result<WorkflowRunResponse> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let streaming = live.is_some();

        let (mut session, persist) = self.load_session(&session_id).await;
        if session.user_id.is_none() {
            session.user_id = options.user_id.clone();
        }

        let state = SessionState::from_map(self.initial_state.clone());
        if let Some(saved) = session.session_state() {
            state.merge(saved);
        }
        self.seed_state(&state, &session, &run_id);

        let intermediate = options
            .stream_intermediate_steps
            .unwrap_or(self.config.stream_intermediate_steps);
        let emitter = EventEmitter::new(
            live,
            self.config.store_events,
            self.config.events_to_skip.iter().copied(),
            intermediate,
            self.event_bus.clone(),
        );
        let scope = RunScope::new(
            &run_id,
            &session_id,
            &self.workflow_id,
            state.clone(),
            emitter,
            Arc::clone(&self.blocking),
        )
        .with_user(options.user_id.clone())
        .with_streaming(streaming);

        let mut response = WorkflowRunResponse::new(&run_id, &session_id, &self.workflow_id);
        response.workflow_name = Some(self.name.clone());
        response.user_id = options.user_id.clone();
        response.input = Some(input.clone());
        response.status = RunStatus::Running;

        info!(
            workflow = %self.name,
            run_id = %run_id,
            session_id = %session_id,
            units = self.units.len(),
            "Workflow run started"
        );
        scope.emit(EventPayload::WorkflowStarted {
            workflow_name: Some(self.name.clone()),
        });

        let ctx = StepContext::new(input, state.clone(), &session_id, options.user_id.clone());
        let outcome = run_sequence(&self.units, ctx, &scope, &Vec::new()).await;

        let fault = match outcome {
            Ok(outcome) => {
                let mut flat = Vec::new();
                for result in &outcome.results {
                    result.collect_atomic(&mut flat);
                }
                response.status = if outcome.halted {
                    RunStatus::Halted
                } else {
                    RunStatus::Completed
                };
                response.content = Some(final_content(&outcome.results, &flat, outcome.halted));
                response.step_results = flat;
                response.unit_results = outcome.results;

                if outcome.halted {
                    info!(run_id = %run_id, "Workflow run halted");
                } else {
                    info!(
                        run_id = %run_id,
                        steps = response.step_results.len(),
                        "Workflow run completed"
                    );
                }
                scope.emit(EventPayload::WorkflowCompleted {
                    status: response.status,
                    content: response.content.clone(),
                    step_count: response.step_results.len(),
                });
                None
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Workflow run failed");
                response.status = RunStatus::Failed;
                response.error = Some(e.to_string());
                scope.emit(EventPayload::WorkflowError {
                    error: e.to_string(),
                });
                Some(e)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        response.metrics = Some(WorkflowMetrics::from_results(
            &response.step_results,
            elapsed_ms,
        ));
        response.events = scope.emitter().take_stored();

        session.upsert_run(response.clone());
        session.set_session_state(state.snapshot());
        session.workflow_name = Some(self.name.clone());
        session
            .workflow_data
            .insert("steps".to_string(), self.describe_units());
        self.save_session(session, persist).await;

        match fault {
            Some(e) => Err(e),
            None => Ok(response),
        }
    }

    fn seed_state(&self, state: &SessionState, session: &WorkflowSession, run_id: &str) {
        state.set("workflow_id", json!(self.workflow_id));
        state.set("workflow_name", json!(self.name));
        state.set("session_id", json!(session.session_id));
        state.set("run_id", json!(run_id));
        if let Some(name) = &session.session_name {
            state.set("session_name", json!(name));
        }
    }

    fn describe_units(&self) -> Value {
        Value::Array(
            self.units
                .iter()
                .map(|u| {
                    json!({
                        "name": u.name(),
                        "kind": u.kind().as_str(),
                        "description": u.description(),
                    })
                })
                .collect(),
        )
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, WorkflowSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the session for a run, never failing.
    ///
    /// The flag is false when storage could not be read: the stored record
    /// may hold history this copy lacks, so it must not be overwritten.
    async fn load_session(&self, session_id: &str) -> (WorkflowSession, bool) {
        let mut persist = true;
        if let Some(storage) = &self.storage {
            match storage.read(session_id).await {
                Ok(Some(session)) => return (session, true),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        backend = storage.name(),
                        error = %e,
                        "Session read failed, continuing in memory"
                    );
                    persist = false;
                }
            }
        }
        if let Some(cached) = self.cache().get(session_id) {
            return (cached.clone(), persist);
        }
        debug!(session_id = %session_id, "Starting new session");
        (WorkflowSession::new(session_id, &self.workflow_id), persist)
    }

    /// Persist a session, never failing. The in-process copy is always kept;
    /// storage is only written when `persist` is set.
    async fn save_session(&self, session: WorkflowSession, persist: bool) {
        self.cache()
            .insert(session.session_id.clone(), session.clone());
        let Some(storage) = &self.storage else {
            return;
        };
        let session_id = session.session_id.clone();
        if !persist {
            warn!(
                session_id = %session_id,
                backend = storage.name(),
                "Skipping session write after failed read"
            );
            return;
        }
        if let Err(e) = storage.upsert(session).await {
            warn!(
                session_id = %session_id,
                backend = storage.name(),
                error = %e,
                "Session write failed, keeping in-memory copy"
            );
        }
    }

    /// Read a session from storage, or the in-process copy without storage.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<WorkflowSession>> {
        match &self.storage {
            Some(storage) => storage.read(session_id).await,
            None => Ok(self.cache().get(session_id).cloned()),
        }
    }

    /// Sessions of this workflow, optionally for one user, newest first.
    pub async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<WorkflowSession>> {
        let filter = SessionFilter {
            user_id: user_id.map(String::from),
            workflow_id: Some(self.workflow_id.clone()),
        };
        match &self.storage {
            Some(storage) => storage.list_sessions(filter).await,
            None => {
                let mut sessions: Vec<WorkflowSession> = self
                    .cache()
                    .values()
                    .filter(|s| filter.matches(s))
                    .cloned()
                    .collect();
                sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                Ok(sessions)
            }
        }
    }

    pub async fn get_run(&self, session_id: &str, run_id: &str) -> Result<Option<StoredRun>> {
        Ok(self
            .get_session(session_id)
            .await?
            .and_then(|s| s.get_run(run_id).cloned()))
    }

    pub async fn rename_session(
        &self,
        session_id: &str,
        session_name: impl Into<String>,
    ) -> Result<WorkflowSession> {
        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| FlowlineError::Storage(format!("session not found: {}", session_id)))?;
        session.rename(session_name);

        self.cache()
            .insert(session.session_id.clone(), session.clone());
        match &self.storage {
            Some(storage) => storage.upsert(session).await,
            None => Ok(session),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.cache().remove(session_id);
        match &self.storage {
            Some(storage) => storage.delete(session_id).await,
            None => Ok(()),
        }
    }
}

/// Final content of a run: the halting result's content when halted, else
/// the last unit that actually ran.
fn final_content(units: &[StepResult], flat: &[StepResult], halted: bool) -> Content {
    if halted {
        if let Some(halting) = flat.iter().rev().find(|r| r.halt) {
            return halting.content.clone();
        }
    }
    units
        .iter()
        .rev()
        .find(|r| !r.skipped)
        .map(|r| r.content.clone())
        .unwrap_or_default()
}

/// Live events from [`Workflow::run_stream`].
///
/// Ends when the run finishes. Call [`RunEventStream::finish`] afterwards for
/// the response.
pub struct RunEventStream {
    rx: mpsc::UnboundedReceiver<RunEvent>,
    handle: Option<JoinHandle<Result<WorkflowRunResponse>>>,
}

impl RunEventStream {
    /// Wait for the run to end and return its response. Unread events are dropped.
    pub async fn finish(mut self) -> Result<WorkflowRunResponse> {
        self.rx.close();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| FlowlineError::Step("run already finished".into()))?;
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(FlowlineError::Step(format!("workflow task failed: {}", e))),
        }
    }
}

impl Stream for RunEventStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        self.rx.poll_recv(cx)
    }
}
