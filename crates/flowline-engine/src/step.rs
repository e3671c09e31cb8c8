use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventPayload, StepIndex};
use flowline_core::traits::{Collaborator, CollaboratorDelta, CollaboratorRequest};
use flowline_core::types::{Content, StepResult, UnitKind};

use crate::context::StepContext;
use crate::scope::RunScope;
use crate::unit::{Unit, UnitRef};

pub type StepFuture = BoxFuture<'static, Result<StepResult>>;
pub type StepStream = BoxStream<'static, Result<StepResult>>;

type AsyncFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;
type BlockingFn = Arc<dyn Fn(StepContext) -> Result<StepResult> + Send + Sync>;
type StreamFn = Arc<dyn Fn(StepContext) -> StepStream + Send + Sync>;

enum Executor {
    Async(AsyncFn),
    Blocking(BlockingFn),
    Stream(StreamFn),
    Collaborator(Arc<dyn Collaborator>),
}

/// An atomic unit: one name bound to one executor.
pub struct Step {
    name: String,
    description: Option<String>,
    executor: Executor,
    max_retries: usize,
    halt_on_failure: bool,
}

impl Step {
    fn with_executor(name: impl Into<String>, executor: Executor) -> Self {
        Self {
            name: name.into(),
            description: None,
            executor,
            max_retries: 0,
            halt_on_failure: false,
        }
    }

    /// A step backed by an async function.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult>> + Send + 'static,
    {
        let f: AsyncFn = Arc::new(move |ctx| f(ctx).boxed());
        Self::with_executor(name, Executor::Async(f))
    }

    /// A step backed by a blocking function, run on the bounded worker pool.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Result<StepResult> + Send + Sync + 'static,
    {
        Self::with_executor(name, Executor::Blocking(Arc::new(f)))
    }

    /// A step producing partial results. Each element is relayed as a content
    /// delta; the elements fold into the final result.
    pub fn streaming<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<StepResult>> + Send + 'static,
    {
        let f: StreamFn = Arc::new(move |ctx| f(ctx).boxed());
        Self::with_executor(name, Executor::Stream(f))
    }

    /// A step delegating to an agent or team.
    pub fn collaborator(name: impl Into<String>, collaborator: Arc<dyn Collaborator>) -> Self {
        Self::with_executor(name, Executor::Collaborator(collaborator))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Re-run a failing step up to `n` extra times.
    pub fn with_retries(mut self, n: usize) -> Self {
        self.max_retries = n;
        self
    }

    /// Turn a failure into a halt of the whole run.
    pub fn halt_on_failure(mut self) -> Self {
        self.halt_on_failure = true;
        self
    }

    pub fn executor_name(&self) -> &str {
        match &self.executor {
            Executor::Collaborator(c) => c.name(),
            _ => &self.name,
        }
    }

    async fn run_once(&self, ctx: StepContext, scope: &RunScope, index: &StepIndex) -> StepResult {
        match &self.executor {
            Executor::Async(f) => {
                let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                    Ok(fut) => fut,
                    Err(panic) => return panicked(&panic),
                };
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => StepResult::failure(e.to_string()),
                    Err(panic) => panicked(&panic),
                }
            }
            Executor::Blocking(f) => {
                let permit = match scope.blocking_permits().acquire_owned().await {
                    Ok(p) => p,
                    Err(e) => return StepResult::failure(format!("worker pool closed: {}", e)),
                };
                let f = Arc::clone(f);
                let joined = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    f(ctx)
                })
                .await;
                match joined {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => StepResult::failure(e.to_string()),
                    Err(e) if e.is_panic() => panicked(&e.into_panic()),
                    Err(e) => StepResult::failure(e.to_string()),
                }
            }
            Executor::Stream(f) => {
                let stream = match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                    Ok(s) => s,
                    Err(panic) => return panicked(&panic),
                };
                self.fold_stream(stream, scope, index).await
            }
            Executor::Collaborator(c) => self.invoke_collaborator(c.as_ref(), ctx, scope, index).await,
        }
    }

    async fn fold_stream(&self, mut stream: StepStream, scope: &RunScope, index: &StepIndex) -> StepResult {
        let mut parts = Vec::new();
        let mut folded = StepResult::default();
        loop {
            match AssertUnwindSafe(stream.next()).catch_unwind().await {
                Ok(Some(Ok(partial))) => {
                    scope.emit(EventPayload::ContentDelta {
                        step_name: self.name.clone(),
                        step_index: index.clone(),
                        delta: partial.content.clone(),
                    });
                    folded.success &= partial.success;
                    folded.halt |= partial.halt;
                    if folded.error.is_none() {
                        folded.error = partial.error;
                    }
                    if partial.metrics.is_some() {
                        folded.metrics = partial.metrics;
                    }
                    parts.push(partial.content);
                }
                Ok(Some(Err(e))) => return StepResult::failure(e.to_string()),
                Ok(None) => break,
                Err(panic) => return panicked(&panic),
            }
        }
        folded.content = Content::concat(&parts);
        folded
    }

    async fn invoke_collaborator(
        &self,
        collaborator: &dyn Collaborator,
        ctx: StepContext,
        scope: &RunScope,
        index: &StepIndex,
    ) -> StepResult {
        let request = CollaboratorRequest {
            input: ctx.collaborator_input(),
            session_id: ctx.session_id().to_string(),
            user_id: ctx.user_id().map(String::from),
            session_state: ctx.session_state().clone(),
            additional_data: ctx.additional_data().cloned(),
        };

        let outcome = if scope.is_streaming() {
            AssertUnwindSafe(self.relay_stream(collaborator, request, scope, index))
                .catch_unwind()
                .await
        } else {
            AssertUnwindSafe(collaborator.invoke(request))
                .catch_unwind()
                .await
        };

        match outcome {
            Ok(Ok(response)) => {
                let mut result = StepResult::new(response.content);
                result.metrics = response.metrics;
                result
            }
            Ok(Err(e)) => {
                let err = FlowlineError::Collaborator {
                    name: collaborator.name().to_string(),
                    message: e.to_string(),
                };
                warn!(step = %self.name, error = %err, "Collaborator failed");
                StepResult::failure(err.to_string())
            }
            Err(panic) => panicked(&panic),
        }
    }

    /// Relay the collaborator's chunks as deltas and return its final response.
    async fn relay_stream(
        &self,
        collaborator: &dyn Collaborator,
        request: CollaboratorRequest,
        scope: &RunScope,
        index: &StepIndex,
    ) -> Result<flowline_core::traits::CollaboratorResponse> {
        let mut stream = collaborator.invoke_stream(request).await?;
        let mut chunks = Vec::new();
        let mut done = None;
        while let Some(delta) = stream.next().await {
            match delta? {
                CollaboratorDelta::Content(chunk) => {
                    scope.emit(EventPayload::ContentDelta {
                        step_name: self.name.clone(),
                        step_index: index.clone(),
                        delta: chunk.clone(),
                    });
                    chunks.push(chunk);
                }
                CollaboratorDelta::Done(response) => done = Some(response),
            }
        }
        Ok(done.unwrap_or_else(|| flowline_core::traits::CollaboratorResponse {
            content: Content::concat(&chunks),
            metrics: None,
        }))
    }
}

impl Unit for Step {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn kind(&self) -> UnitKind {
        match &self.executor {
            Executor::Collaborator(c) => c.kind().unit_kind(),
            _ => UnitKind::Function,
        }
    }

    fn execute<'a>(
        &'a self,
        ctx: StepContext,
        scope: &'a RunScope,
        index: StepIndex,
    ) -> BoxFuture<'a, Result<StepResult>> {
        Box::pin(async move {
            scope.emit(EventPayload::StepStarted {
                step_name: self.name.clone(),
                step_index: index.clone(),
            });
            debug!(step = %self.name, index = ?index, "Step started");

            let start = Instant::now();
            let mut attempt = 0;
            let mut result = loop {
                let result = self.run_once(ctx.clone(), scope, &index).await;
                if result.success || result.halt || attempt >= self.max_retries {
                    break result;
                }
                attempt += 1;
                warn!(
                    step = %self.name,
                    attempt,
                    max_retries = self.max_retries,
                    error = result.error.as_deref().unwrap_or(""),
                    "Step failed, retrying"
                );
            };

            result.step_name = self.name.clone();
            result.kind = self.kind();
            result.executor_name = Some(self.executor_name().to_string());
            result.elapsed_ms = start.elapsed().as_millis() as u64;

            if !result.success {
                warn!(
                    step = %self.name,
                    error = result.error.as_deref().unwrap_or(""),
                    "Step failed"
                );
                if self.halt_on_failure {
                    result.halt = true;
                }
            }
            if result.halt {
                info!(step = %self.name, "Step requested halt");
                scope.halt();
            }

            scope.emit(EventPayload::StepCompleted {
                step_name: self.name.clone(),
                step_index: index,
                result: result.clone(),
            });
            Ok(result)
        })
    }
}

impl From<Step> for UnitRef {
    fn from(step: Step) -> Self {
        Arc::new(step)
    }
}

fn panicked(panic: &Box<dyn Any + Send>) -> StepResult {
    StepResult::failure(format!("step panicked: {}", panic_message(panic)))
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
