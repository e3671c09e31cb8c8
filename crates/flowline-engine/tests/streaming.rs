use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::StreamExt;

use flowline_core::event::{EventBus, EventKind, EventPayload, RunEvent};
use flowline_core::types::{Content, UnitKind};
use flowline_engine::{RunEventStream, RunOptions, Step, Workflow};
use flowline_test_utils::{event_kinds, text_step, MockCollaborator};

async fn drain(stream: &mut RunEventStream) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

fn two_steps() -> Workflow {
    Workflow::builder("pair")
        .unit(text_step("a", "A"))
        .unit(text_step("b", "B"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_intermediate_events_in_order() {
    let wf = Arc::new(two_steps());
    let mut stream = wf.run_stream("x", RunOptions::new().intermediate_steps(true));
    let events = drain(&mut stream).await;
    let resp = stream.finish().await.unwrap();

    assert_eq!(
        event_kinds(&events),
        vec![
            EventKind::WorkflowStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::WorkflowCompleted,
        ]
    );
    assert!(events.iter().all(|e| e.run_id == resp.run_id));
    match &events[3].payload {
        EventPayload::StepStarted { step_name, step_index } => {
            assert_eq!(step_name, "b");
            assert_eq!(step_index, &vec![1]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_without_intermediate_only_workflow_events() {
    let wf = Arc::new(two_steps());
    let mut stream = wf.run_stream("x", RunOptions::new());
    let events = drain(&mut stream).await;
    stream.finish().await.unwrap();
    assert_eq!(
        event_kinds(&events),
        vec![EventKind::WorkflowStarted, EventKind::WorkflowCompleted]
    );
}

#[tokio::test]
async fn test_skipped_kinds_never_appear() {
    let wf = Arc::new(
        Workflow::builder("pair")
            .unit(text_step("a", "A"))
            .skip_events([EventKind::StepStarted])
            .store_events(true)
            .build()
            .unwrap(),
    );
    let mut stream = wf.run_stream("x", RunOptions::new().intermediate_steps(true));
    let events = drain(&mut stream).await;
    let resp = stream.finish().await.unwrap();

    assert!(!event_kinds(&events).contains(&EventKind::StepStarted));
    assert!(event_kinds(&events).contains(&EventKind::StepCompleted));
    let stored = resp.events.unwrap();
    assert_eq!(event_kinds(&stored), event_kinds(&events));
}

#[tokio::test]
async fn test_collaborator_chunks_become_deltas() {
    let agent = MockCollaborator::new("writer", "unused").with_chunks(&["Hel", "lo"]);
    let calls = agent.call_counter();
    let wf = Arc::new(
        Workflow::builder("chat")
            .unit(Step::collaborator("write", Arc::new(agent)))
            .build()
            .unwrap(),
    );

    let mut stream = wf.run_stream("hi", RunOptions::new());
    let events = drain(&mut stream).await;
    let resp = stream.finish().await.unwrap();

    let deltas: Vec<Content> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ContentDelta { delta, .. } => Some(delta.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec![Content::text("Hel"), Content::text("lo")]);
    assert_eq!(resp.content, Some(Content::text("Hello")));
    assert_eq!(resp.step_results[0].kind, UnitKind::Agent);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blocking_run_uses_final_reply() {
    let agent = MockCollaborator::new("team", "final answer")
        .team()
        .with_chunks(&["ignored"]);
    let inputs = agent.inputs();
    let wf = Workflow::builder("chat")
        .unit(text_step("brief", "the brief"))
        .unit(Step::collaborator("discuss", Arc::new(agent)))
        .build()
        .unwrap();

    let resp = wf.run("topic", RunOptions::new()).await.unwrap();
    assert_eq!(resp.content, Some(Content::text("final answer")));
    assert_eq!(resp.step_results[1].kind, UnitKind::Team);
    assert_eq!(inputs.lock().unwrap()[0], Content::text("the brief"));
}

#[tokio::test]
async fn test_collaborator_failure_is_a_failed_step() {
    let agent = MockCollaborator::new("flaky", "x").failing("rate limited");
    let wf = Workflow::builder("chat")
        .unit(Step::collaborator("ask", Arc::new(agent)))
        .build()
        .unwrap();
    let resp = wf.run("x", RunOptions::new()).await.unwrap();
    let step = &resp.step_results[0];
    assert!(!step.success);
    assert!(step.error.as_deref().unwrap().contains("rate limited"));
}

#[tokio::test]
async fn test_bus_sees_unit_events_without_intermediate() {
    let bus = Arc::new(EventBus::new(64));
    let mut rx = bus.subscribe();
    let wf = Workflow::builder("pair")
        .unit(text_step("a", "A"))
        .event_bus(Arc::clone(&bus))
        .build()
        .unwrap();
    wf.run("x", RunOptions::new()).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::WorkflowCompleted,
        ]
    );
}
