use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowline_core::event::{EventKind, EventPayload, RunEvent};

/// JSONL run logger.
///
/// Reads from an EventBus subscription and writes one JSON object per line
/// for a single session. Lines are flushed as they are written, so a crashed run
/// still leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    session_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{session_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=+unit events, 3=+content deltas.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task.
    ///
    /// Subscribe before the run starts so no early event is missed. Writes
    /// JSONL for `session_id` until cancellation or the end of a run.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        session_id: String,
        cancel: CancellationToken,
    ) {
        let session_dir = self.log_dir.join(&session_id);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.session_id != session_id {
                                continue;
                            }
                            let entry = match self.event_to_entry(&event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event.kind(), EventKind::WorkflowCompleted | EventKind::WorkflowError) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let kind = event.kind();
        let required = match kind {
            EventKind::WorkflowStarted | EventKind::WorkflowCompleted | EventKind::WorkflowError => 1,
            EventKind::ContentDelta => 3,
            _ => 2,
        };
        if self.level < required {
            return None;
        }

        let detail = match &event.payload {
            EventPayload::WorkflowStarted { workflow_name } => {
                workflow_name.as_ref().map(|n| serde_json::json!({ "workflow_name": n }))
            }
            EventPayload::WorkflowCompleted {
                status,
                content,
                step_count,
            } => Some(serde_json::json!({
                "status": status,
                "step_count": step_count,
                "content_preview": content.as_ref().map(|c| truncate_str(&c.to_text(), 200).to_string()),
            })),
            EventPayload::WorkflowError { error } => Some(serde_json::json!({ "error": error })),
            EventPayload::StepCompleted { result, .. } => Some(serde_json::json!({
                "success": result.success,
                "halt": result.halt,
                "elapsed_ms": result.elapsed_ms,
                "content_preview": truncate_str(&result.content.to_text(), 200),
            })),
            EventPayload::ParallelStarted { branch_count, .. } => {
                Some(serde_json::json!({ "branch_count": branch_count }))
            }
            EventPayload::LoopIterationCompleted {
                iteration,
                should_continue,
                ..
            } => Some(serde_json::json!({
                "iteration": iteration,
                "should_continue": should_continue,
            })),
            EventPayload::ConditionStarted { condition_result, .. } => {
                Some(serde_json::json!({ "condition_result": condition_result }))
            }
            EventPayload::RouterStarted { selected_steps, .. } => {
                Some(serde_json::json!({ "selected_steps": selected_steps }))
            }
            EventPayload::ContentDelta { delta, .. } => Some(serde_json::json!({
                "delta": truncate_str(&delta.to_text(), 500),
            })),
            _ => None,
        };

        Some(LogEntry {
            timestamp: event.created_at.to_rfc3339(),
            run_id: event.run_id.clone(),
            session_id: event.session_id.clone(),
            event_type: kind.as_str(),
            step: event.payload.step_name().map(String::from),
            detail,
        })
    }
}

/// Truncate a string for logging, on a character boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowline_core::event::EventBus;
    use flowline_core::types::{RunStatus, StepResult};

    fn event(payload: EventPayload) -> RunEvent {
        RunEvent {
            created_at: Utc::now(),
            run_id: "run-1".into(),
            session_id: "sess-1".into(),
            workflow_id: "wf".into(),
            payload,
        }
    }

    #[test]
    fn test_jsonl_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&event(EventPayload::WorkflowStarted { workflow_name: None }))
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("workflow_started"));
        assert!(json.contains("sess-1"));
        assert!(!json.contains("step"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let started = event(EventPayload::StepStarted {
            step_name: "a".into(),
            step_index: vec![0],
        });
        let delta = event(EventPayload::ContentDelta {
            step_name: "a".into(),
            step_index: vec![0],
            delta: "chunk".into(),
        });
        let done = event(EventPayload::WorkflowCompleted {
            status: RunStatus::Completed,
            content: None,
            step_count: 1,
        });

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&done).is_some());
        assert!(l1.event_to_entry(&started).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&started).is_some());
        assert!(l2.event_to_entry(&delta).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&delta).is_some());
    }

    #[test]
    fn test_step_completed_detail() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger
            .event_to_entry(&event(EventPayload::StepCompleted {
                step_name: "gate".into(),
                step_index: vec![2],
                result: StepResult::failure("nope").halted(),
            }))
            .unwrap();
        assert_eq!(entry.step.as_deref(), Some("gate"));
        let detail = entry.detail.unwrap();
        assert_eq!(detail["success"], false);
        assert_eq!(detail["halt"], true);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 200), "short");
    }

    #[tokio::test]
    async fn test_writes_until_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let task = tokio::spawn(logger.run(
            bus.subscribe(),
            "sess-1".into(),
            CancellationToken::new(),
        ));

        bus.publish(event(EventPayload::WorkflowStarted { workflow_name: Some("wf".into()) }));
        bus.publish(event(EventPayload::WorkflowCompleted {
            status: RunStatus::Completed,
            content: None,
            step_count: 0,
        }));
        task.await.unwrap();

        let session_dir = dir.path().join("sess-1");
        let file = std::fs::read_dir(&session_dir).unwrap().next().unwrap().unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
