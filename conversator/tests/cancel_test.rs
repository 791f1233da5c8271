//! Cooperative cancellation, including cancellation during a pending gate.

mod support;

use conversator::actors::EventStoreMsg;
use conversator::builders::RemoteEvent;
use shared_types::{GateKind, InboxSeverity, RemoteSessionStatus, TaskStatus};

use support::*;

async fn run_to_gate(core: &support::TestCore) -> (String, String) {
    let task = ready_task(core, "JWT refresh fix").await;
    let outcome = dispatch(core, &task.task_id).await;
    let session_id = outcome.session_id;

    wait_for_stream(&core.builder, &session_id).await;
    core.builder
        .emit(&session_id, RemoteEvent::Status { status: RemoteSessionStatus::Running })
        .await;
    wait_for_status(core, &task.task_id, TaskStatus::Running).await;

    core.builder
        .emit(
            &session_id,
            RemoteEvent::Gate {
                gate_id: "perm-1".to_string(),
                kind: GateKind::Write,
                description: "edit files".to_string(),
                files: vec![],
            },
        )
        .await;
    wait_for_status(core, &task.task_id, TaskStatus::AwaitingGate).await;

    (task.task_id, session_id)
}

#[tokio::test]
async fn cancel_during_gate_denies_then_cancels() {
    let core = boot_core().await;
    let (task_id, session_id) = run_to_gate(&core).await;

    cancel(&core, &task_id, "never mind").await;
    wait_for_status(&core, &task_id, TaskStatus::Canceled).await;

    // The pending gate was auto-denied before cancellation, the remote abort
    // was invoked, and the aborted frame confirmed the cancel.
    wait_for_event_count(&core, "TaskCanceled", 2).await;

    let types = event_types(&core).await;
    let gate_pos = types.iter().position(|t| t == "GateDenied").unwrap();
    let cancel_pos = types.iter().position(|t| t == "TaskCanceled").unwrap();
    assert!(gate_pos < cancel_pos, "auto-deny must precede cancellation: {types:?}");

    assert_eq!(core.builder.abort_calls(&session_id).await, 1);
    assert_eq!(
        core.builder.gate_replies().await,
        vec![(session_id.clone(), "perm-1".to_string(), false)]
    );

    // Both cancel phases were recorded; the second confirmed.
    let events = ractor::call!(core.store, |reply| EventStoreMsg::GetEvents {
        task_id: Some(task_id.clone()),
        since_seq: 0,
        limit: i64::MAX,
        reply
    })
    .unwrap()
    .unwrap();
    let phases: Vec<String> = events
        .iter()
        .filter(|e| e.event_type == shared_types::EventType::TaskCanceled)
        .filter_map(|e| e.payload.get("phase").and_then(|p| p.as_str()).map(str::to_string))
        .collect();
    assert_eq!(phases, vec!["pending", "confirmed"]);

    core.shutdown().await;
}

#[tokio::test]
async fn unconfirmed_abort_still_cancels_with_warning() {
    let core = boot_core().await;
    core.builder.set_confirm_aborts(false).await;
    let (task_id, session_id) = run_to_gate(&core).await;

    cancel(&core, &task_id, "never mind").await;
    wait_for_status(&core, &task_id, TaskStatus::Canceled).await;

    // The abort deadline elapses without remote confirmation.
    wait_for_event_count(&core, "TaskCanceled", 2).await;

    let events = ractor::call!(core.store, |reply| EventStoreMsg::GetEvents {
        task_id: Some(task_id.clone()),
        since_seq: 0,
        limit: i64::MAX,
        reply
    })
    .unwrap()
    .unwrap();
    let last_cancel = events
        .iter()
        .filter(|e| e.event_type == shared_types::EventType::TaskCanceled)
        .last()
        .unwrap();
    assert_eq!(
        last_cancel.payload.get("phase").and_then(|p| p.as_str()),
        Some("unconfirmed")
    );

    assert!(core.builder.abort_calls(&session_id).await >= 1);

    let warnings = ractor::call!(core.store, |reply| EventStoreMsg::ListInbox {
        unread_only: false,
        severity: Some(InboxSeverity::Warning),
        limit: 10,
        reply
    })
    .unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].summary.contains("unconfirmed"));

    core.shutdown().await;
}

#[tokio::test]
async fn cancel_before_dispatch_confirms_immediately() {
    let core = boot_core().await;
    let task = create_task(&core, "x").await;
    update_prompt(&core, &task.task_id, "goal").await;

    cancel(&core, &task.task_id, "changed my mind").await;
    wait_for_status(&core, &task.task_id, TaskStatus::Canceled).await;

    // With no remote session to abort, the cancel settles immediately.
    wait_for_event_count(&core, "TaskCanceled", 2).await;

    core.shutdown().await;
}

#[tokio::test]
async fn terminal_task_cannot_be_canceled_again() {
    let core = boot_core().await;
    let task = create_task(&core, "x").await;
    update_prompt(&core, &task.task_id, "goal").await;
    cancel(&core, &task.task_id, "first").await;
    wait_for_status(&core, &task.task_id, TaskStatus::Canceled).await;

    let result = ractor::call!(core.orchestrator, |reply| {
        conversator::actors::OrchestratorMsg::Cancel {
            task_id: task.task_id.clone(),
            reason: "second".to_string(),
            command_id: None,
            reply,
        }
    })
    .unwrap();
    assert!(matches!(result, Err(conversator::actors::CommandError::Conflict(_))));

    core.shutdown().await;
}
