use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use flowline_core::event::{EventBus, EventKind, EventPayload, RunEvent, StepIndex};
use flowline_core::state::SessionState;

/// Routes run events to the live stream, the stored log, and the event bus.
///
/// Skipped kinds go nowhere. Unit-level kinds reach the live stream and the
/// stored log only when intermediate steps are enabled; the bus sees every
/// kind that is not skipped.
pub struct EventEmitter {
    live: Option<mpsc::UnboundedSender<RunEvent>>,
    stored: Option<Mutex<Vec<RunEvent>>>,
    skip: HashSet<EventKind>,
    intermediate: bool,
    bus: Option<Arc<EventBus>>,
}

impl EventEmitter {
    pub fn new(
        live: Option<mpsc::UnboundedSender<RunEvent>>,
        store: bool,
        skip: impl IntoIterator<Item = EventKind>,
        intermediate: bool,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            live,
            stored: store.then(|| Mutex::new(Vec::new())),
            skip: skip.into_iter().collect(),
            intermediate,
            bus,
        }
    }

    /// An emitter that drops everything.
    pub fn disabled() -> Self {
        Self::new(None, false, [], false, None)
    }

    pub fn emit(&self, event: RunEvent) {
        let kind = event.kind();
        if self.skip.contains(&kind) {
            return;
        }
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        if kind.is_intermediate() && !self.intermediate {
            return;
        }
        if let Some(stored) = &self.stored {
            stored
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        }
        if let Some(live) = &self.live {
            if live.send(event).is_err() {
                debug!(kind = %kind, "Event stream receiver dropped");
            }
        }
    }

    /// Take the stored log, if event storage is enabled.
    pub fn take_stored(&self) -> Option<Vec<RunEvent>> {
        self.stored
            .as_ref()
            .map(|s| std::mem::take(&mut *s.lock().unwrap_or_else(|e| e.into_inner())))
    }
}

/// Per-run state shared by every unit in the tree.
pub struct RunScope {
    pub run_id: String,
    pub session_id: String,
    pub workflow_id: String,
    pub user_id: Option<String>,
    session_state: SessionState,
    emitter: EventEmitter,
    halted: AtomicBool,
    blocking: Arc<Semaphore>,
    streaming: bool,
}

impl RunScope {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        workflow_id: impl Into<String>,
        session_state: SessionState,
        emitter: EventEmitter,
        blocking: Arc<Semaphore>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            user_id: None,
            session_state,
            emitter,
            halted: AtomicBool::new(false),
            blocking,
            streaming: false,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Collaborators are invoked in streaming mode and their chunks relayed.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session_state
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn emit(&self, payload: EventPayload) {
        self.emitter.emit(RunEvent {
            created_at: Utc::now(),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            workflow_id: self.workflow_id.clone(),
            payload,
        });
    }

    /// Mark the run halted. No unit starts after this.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Permits bounding how many blocking step functions run at once.
    pub fn blocking_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.blocking)
    }
}

/// Index of the `position`-th child under `parent`.
pub fn child_index(parent: &StepIndex, position: usize) -> StepIndex {
    let mut index = parent.clone();
    index.push(position);
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(kind: EventKind) -> EventPayload {
        match kind {
            EventKind::WorkflowStarted => EventPayload::WorkflowStarted { workflow_name: None },
            EventKind::StepStarted => EventPayload::StepStarted {
                step_name: "a".into(),
                step_index: vec![0],
            },
            _ => EventPayload::ContentDelta {
                step_name: "a".into(),
                step_index: vec![0],
                delta: "x".into(),
            },
        }
    }

    fn scope(emitter: EventEmitter) -> RunScope {
        RunScope::new("run", "sess", "wf", SessionState::new(), emitter, Arc::new(Semaphore::new(1)))
    }

    #[test]
    fn test_intermediate_events_filtered_from_stream_and_store() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = scope(EventEmitter::new(Some(tx), true, [], false, None));
        s.emit(payload(EventKind::WorkflowStarted));
        s.emit(payload(EventKind::StepStarted));
        s.emit(payload(EventKind::ContentDelta));

        let stored = s.emitter().take_stored().unwrap();
        let kinds: Vec<_> = stored.iter().map(RunEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::WorkflowStarted, EventKind::ContentDelta]);
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::WorkflowStarted);
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::ContentDelta);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_skip_set_applies_everywhere() {
        let bus = Arc::new(EventBus::new(8));
        let mut bus_rx = bus.subscribe();
        let s = scope(EventEmitter::new(
            None,
            true,
            [EventKind::ContentDelta],
            true,
            Some(bus),
        ));
        s.emit(payload(EventKind::ContentDelta));
        s.emit(payload(EventKind::StepStarted));

        let kinds: Vec<_> = s
            .emitter()
            .take_stored()
            .unwrap()
            .iter()
            .map(RunEvent::kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::StepStarted]);
        assert_eq!(bus_rx.try_recv().unwrap().kind(), EventKind::StepStarted);
        assert!(bus_rx.try_recv().is_err());
    }

    #[test]
    fn test_halt_flag() {
        let s = scope(EventEmitter::disabled());
        assert!(!s.is_halted());
        s.halt();
        assert!(s.is_halted());
        assert!(s.emitter().take_stored().is_none());
    }

    #[test]
    fn test_child_index() {
        assert_eq!(child_index(&vec![1, 2], 0), vec![1, 2, 0]);
        assert_eq!(child_index(&Vec::new(), 3), vec![3]);
    }
}
