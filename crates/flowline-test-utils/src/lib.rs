//! Shared mocks and step fixtures for Flowline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventKind, RunEvent};
use flowline_core::traits::{
    Collaborator, CollaboratorDelta, CollaboratorKind, CollaboratorRequest, CollaboratorResponse,
};
use flowline_core::types::{Content, StepResult};
use flowline_engine::{Step, StepContext, UnitRef};

/// Scripted collaborator that records every call.
pub struct MockCollaborator {
    name: String,
    kind: CollaboratorKind,
    reply: String,
    chunks: Vec<String>,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Content>>>,
}

impl MockCollaborator {
    pub fn new(name: &str, reply: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CollaboratorKind::Agent,
            reply: reply.to_string(),
            chunks: Vec::new(),
            failure: None,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn team(mut self) -> Self {
        self.kind = CollaboratorKind::Team;
        self
    }

    /// In streaming mode, send these chunks and let the engine concatenate them.
    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Fail every call with this message.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared counter, readable after the collaborator moves into a step.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Inputs received so far, oldest first.
    pub fn inputs(&self) -> Arc<Mutex<Vec<Content>>> {
        Arc::clone(&self.inputs)
    }

    fn record(&self, request: &CollaboratorRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(request.input.clone());
        }
        match &self.failure {
            Some(message) => Err(FlowlineError::Step(message.clone())),
            None => Ok(()),
        }
    }
}

impl Collaborator for MockCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CollaboratorKind {
        self.kind
    }

    fn invoke(&self, request: CollaboratorRequest) -> BoxFuture<'_, Result<CollaboratorResponse>> {
        Box::pin(async move {
            self.record(&request)?;
            Ok(CollaboratorResponse::new(self.reply.as_str()))
        })
    }

    fn invoke_stream(
        &self,
        request: CollaboratorRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<CollaboratorDelta>>>> {
        Box::pin(async move {
            self.record(&request)?;
            let deltas: Vec<Result<CollaboratorDelta>> = if self.chunks.is_empty() {
                vec![Ok(CollaboratorDelta::Done(CollaboratorResponse::new(
                    self.reply.as_str(),
                )))]
            } else {
                self.chunks
                    .iter()
                    .map(|c| Ok(CollaboratorDelta::Content(Content::text(c.clone()))))
                    .collect()
            };
            let stream: BoxStream<'_, Result<CollaboratorDelta>> =
                Box::pin(futures::stream::iter(deltas));
            Ok(stream)
        })
    }
}

/// A step that always produces `text`.
pub fn text_step(name: &str, text: &str) -> UnitRef {
    let text = text.to_string();
    Step::from_fn(name, move |_ctx: StepContext| {
        let text = text.clone();
        async move { Ok(StepResult::new(text)) }
    })
    .into()
}

/// A step producing the previous content (or the input) with `suffix` appended.
pub fn append_step(name: &str, suffix: &str) -> UnitRef {
    let suffix = suffix.to_string();
    Step::from_fn(name, move |ctx: StepContext| {
        let text = format!("{}{}", ctx.collaborator_input().to_text(), suffix);
        async move { Ok(StepResult::new(text)) }
    })
    .into()
}

/// A step that counts its invocations.
pub fn counting_step(name: &str, text: &str) -> (UnitRef, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let text = text.to_string();
    let step = Step::from_fn(name, move |_ctx: StepContext| {
        seen.fetch_add(1, Ordering::SeqCst);
        let text = text.clone();
        async move { Ok(StepResult::new(text)) }
    });
    (step.into(), counter)
}

/// A step that requests a halt of the whole run.
pub fn halting_step(name: &str) -> UnitRef {
    let text = format!("{} stopped the run", name);
    Step::from_fn(name, move |_ctx: StepContext| {
        let result = StepResult::new(text.clone()).halted();
        async move { Ok(result) }
    })
    .into()
}

/// A step that reports failure without halting.
pub fn failing_step(name: &str, message: &str) -> UnitRef {
    let message = message.to_string();
    Step::from_fn(name, move |_ctx: StepContext| {
        let message = message.clone();
        async move { Err(FlowlineError::Step(message)) }
    })
    .into()
}

/// A step that sleeps before producing `text`.
pub fn delayed_step(name: &str, delay: Duration, text: &str) -> UnitRef {
    let text = text.to_string();
    Step::from_fn(name, move |_ctx: StepContext| {
        let text = text.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(StepResult::new(text))
        }
    })
    .into()
}

pub fn event_kinds(events: &[RunEvent]) -> Vec<EventKind> {
    events.iter().map(RunEvent::kind).collect()
}
