use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::session::WorkflowSession;
use flowline_core::traits::{SessionFilter, SessionStorage};
use flowline_core::types::{Content, RunStatus, StepResult};
use flowline_engine::{RunOptions, Step, StepContext, Workflow};
use flowline_storage::{InMemoryStorage, JsonFileStorage, SqliteStorage};
use flowline_test_utils::{append_step, halting_step};

/// Counts runs through session state.
fn counter_workflow(storage: Arc<dyn SessionStorage>) -> Workflow {
    Workflow::builder("counter")
        .workflow_id("wf-counter")
        .storage(storage)
        .unit(Step::from_fn("bump", |ctx: StepContext| {
            let n = ctx
                .session_state()
                .get("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + 1;
            ctx.session_state().set("count", json!(n));
            async move { Ok(StepResult::new(format!("run {}", n))) }
        }))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_sqlite_history_grows_by_one_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");

    for n in 1..=3usize {
        // A fresh engine each time: history must come from disk.
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let wf = counter_workflow(storage);
        let resp = wf.run("go", RunOptions::new().session("s1")).await.unwrap();
        assert_eq!(resp.content, Some(Content::text(format!("run {}", n))));

        let session = wf.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.runs.len(), n);
        assert_eq!(session.last_run().unwrap().run_id(), resp.run_id);
    }
}

#[tokio::test]
async fn test_runs_are_kept_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn SessionStorage> = Arc::new(JsonFileStorage::new(dir.path()));
    let wf = counter_workflow(Arc::clone(&storage));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(wf.run("go", RunOptions::new().session("s1")).await.unwrap().run_id);
    }
    let session = storage.read("s1").await.unwrap().unwrap();
    let stored: Vec<_> = session.runs.iter().map(|r| r.run_id().to_string()).collect();
    assert_eq!(stored, ids);
    assert_eq!(session.session_state().unwrap()["count"], 3);
}

#[tokio::test]
async fn test_halted_runs_are_recorded() {
    let storage: Arc<dyn SessionStorage> = Arc::new(SqliteStorage::in_memory().unwrap());
    let wf = Workflow::builder("stops")
        .storage(Arc::clone(&storage))
        .unit(halting_step("gate"))
        .unit(append_step("never", "!"))
        .build()
        .unwrap();
    let resp = wf
        .run("x", RunOptions::new().session("s").user("alice"))
        .await
        .unwrap();
    assert_eq!(resp.status, RunStatus::Halted);

    let session = storage.read("s").await.unwrap().unwrap();
    assert_eq!(session.count_with_status(RunStatus::Halted), 1);
    assert_eq!(session.user_id.as_deref(), Some("alice"));
    assert_eq!(wf.list_sessions(Some("alice")).await.unwrap().len(), 1);
    assert!(wf.list_sessions(Some("bob")).await.unwrap().is_empty());

    let run = wf.get_run("s", &resp.run_id).await.unwrap().unwrap();
    assert_eq!(run.response().unwrap().executed_step_names(), vec!["gate"]);
}

#[tokio::test]
async fn test_rename_persists_to_storage() {
    let storage: Arc<dyn SessionStorage> = Arc::new(SqliteStorage::in_memory().unwrap());
    let wf = counter_workflow(Arc::clone(&storage));
    wf.run("go", RunOptions::new().session("s1")).await.unwrap();
    wf.rename_session("s1", "nightly").await.unwrap();

    let session = storage.read("s1").await.unwrap().unwrap();
    assert_eq!(session.session_name.as_deref(), Some("nightly"));
    assert_eq!(session.session_state().unwrap()["session_name"], "nightly");
    assert!(wf.rename_session("missing", "x").await.is_err());
}

/// Storage whose every call fails.
struct BrokenStorage;

impl SessionStorage for BrokenStorage {
    fn name(&self) -> &str {
        "broken"
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(FlowlineError::Storage("disk gone".into())) })
    }

    fn upsert(&self, _session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>> {
        Box::pin(async { Err(FlowlineError::Storage("disk gone".into())) })
    }

    fn read(&self, _session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        Box::pin(async { Err(FlowlineError::Storage("disk gone".into())) })
    }

    fn list_sessions(&self, _filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        Box::pin(async { Err(FlowlineError::Storage("disk gone".into())) })
    }

    fn delete(&self, _session_id: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(FlowlineError::Storage("disk gone".into())) })
    }
}

#[tokio::test]
async fn test_storage_faults_do_not_fail_runs() {
    let wf = counter_workflow(Arc::new(BrokenStorage));
    let first = wf.run("go", RunOptions::new().session("s")).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);

    // The in-process copy carries state between runs.
    let second = wf.run("go", RunOptions::new().session("s")).await.unwrap();
    assert_eq!(second.content, Some(Content::text("run 2")));
}

/// In-memory storage whose `fail_on`-th read reports a lock error.
struct FlakyStorage {
    inner: InMemoryStorage,
    reads: AtomicUsize,
    fail_on: usize,
}

impl SessionStorage for FlakyStorage {
    fn name(&self) -> &str {
        "flaky"
    }

    fn create(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.create()
    }

    fn upsert(&self, session: WorkflowSession) -> BoxFuture<'_, Result<WorkflowSession>> {
        self.inner.upsert(session)
    }

    fn read(&self, session_id: &str) -> BoxFuture<'_, Result<Option<WorkflowSession>>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Box::pin(async { Err(FlowlineError::Storage("database is locked".into())) });
        }
        self.inner.read(session_id)
    }

    fn list_sessions(&self, filter: SessionFilter) -> BoxFuture<'_, Result<Vec<WorkflowSession>>> {
        self.inner.list_sessions(filter)
    }

    fn delete(&self, session_id: &str) -> BoxFuture<'_, Result<()>> {
        self.inner.delete(session_id)
    }
}

#[tokio::test]
async fn test_failed_read_keeps_stored_history() {
    let storage = Arc::new(FlakyStorage {
        inner: InMemoryStorage::new(),
        reads: AtomicUsize::new(0),
        fail_on: 3,
    });
    let shared: Arc<dyn SessionStorage> = storage.clone();

    for _ in 0..2 {
        counter_workflow(Arc::clone(&shared))
            .run("go", RunOptions::new().session("s1"))
            .await
            .unwrap();
    }

    // Third read fails: the run still completes, but must not clobber history.
    let third = counter_workflow(Arc::clone(&shared))
        .run("go", RunOptions::new().session("s1"))
        .await
        .unwrap();
    assert_eq!(third.status, RunStatus::Completed);
    let stored = storage.inner.read("s1").await.unwrap().unwrap();
    assert_eq!(stored.runs.len(), 2);

    // Once reads recover, history keeps growing from what was stored.
    let fourth = counter_workflow(Arc::clone(&shared))
        .run("go", RunOptions::new().session("s1"))
        .await
        .unwrap();
    assert_eq!(fourth.content, Some(Content::text("run 3")));
    let stored = storage.inner.read("s1").await.unwrap().unwrap();
    assert_eq!(stored.runs.len(), 3);
}
