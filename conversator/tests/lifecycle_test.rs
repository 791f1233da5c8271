//! Refinement lifecycle: vague request through frozen handoff.

mod support;

use serde_json::json;
use shared_types::{EventType, TaskStatus};

use support::*;

#[tokio::test]
async fn vague_request_to_handoff() {
    let core = boot_core().await;

    // Capture, refine with a question round, freeze.
    let task = create_task(&core, "JWT refresh fix").await;
    assert_eq!(task.status, TaskStatus::Draft);
    assert!(task.working_prompt_path.is_some());

    update_prompt(&core, &task.task_id, "fails after 15m idle").await;
    raise_questions(&core, &task.task_id, &["auto-refresh?", "idle cap?"]).await;
    assert_eq!(get_task(&core, &task.task_id).await.status, TaskStatus::AwaitingUser);

    answer_questions(&core, &task.task_id, json!({"auto_refresh": true, "idle_cap_min": 30}))
        .await;
    let paths = freeze_prompt(&core, &task.task_id).await;

    assert_eq!(
        event_types(&core).await,
        vec![
            "TaskCreated",
            "WorkingPromptUpdated",
            "QuestionsRaised",
            "UserAnswered",
            "HandoffFrozen",
        ]
    );

    let task = get_task(&core, &task.task_id).await;
    assert_eq!(task.status, TaskStatus::ReadyToHandoff);
    assert!(std::path::Path::new(&paths.handoff_md_path).exists());
    assert!(std::path::Path::new(&paths.handoff_json_path).exists());
    assert_eq!(task.handoff_prompt_path.as_deref(), Some(paths.handoff_md_path.as_str()));

    // The contract parses and carries the captured goal.
    let raw = std::fs::read_to_string(&paths.handoff_json_path).unwrap();
    let spec = shared_types::ExecutionSpec::from_json(&raw).unwrap();
    assert_eq!(spec.goal, "fails after 15m idle");

    core.shutdown().await;
}

#[tokio::test]
async fn freeze_is_idempotent_with_single_event() {
    let core = boot_core().await;
    let task = create_task(&core, "x").await;
    update_prompt(&core, &task.task_id, "goal").await;

    let first = freeze_prompt(&core, &task.task_id).await;
    let second = freeze_prompt(&core, &task.task_id).await;

    assert_eq!(first.handoff_md_path, second.handoff_md_path);
    assert_eq!(first.handoff_json_path, second.handoff_json_path);

    let frozen_events = event_types(&core)
        .await
        .into_iter()
        .filter(|t| t == EventType::HandoffFrozen.as_str())
        .count();
    assert_eq!(frozen_events, 1);

    core.shutdown().await;
}

#[tokio::test]
async fn working_prompt_is_immutable_after_freeze() {
    let core = boot_core().await;
    let task = create_task(&core, "x").await;
    update_prompt(&core, &task.task_id, "goal").await;
    freeze_prompt(&core, &task.task_id).await;

    let result = ractor::call!(core.orchestrator, |reply| {
        conversator::actors::OrchestratorMsg::UpdateWorkingPrompt {
            task_id: task.task_id.clone(),
            delta_summary: "late edit".to_string(),
            patch: conversator::prompts::WorkingPromptPatch {
                intent: Some("changed my mind".to_string()),
                ..Default::default()
            },
            command_id: None,
            reply,
        }
    })
    .unwrap();

    assert!(matches!(result, Err(conversator::actors::CommandError::Conflict(_))));

    // The frozen document on disk is untouched.
    let topic: String = task.task_id.chars().take(8).collect();
    let prompt = core.prompts.read_working(&topic).await.unwrap();
    assert_eq!(prompt.intent, "goal");

    core.shutdown().await;
}

#[tokio::test]
async fn repeated_command_id_yields_original_outcome_without_new_events() {
    let core = boot_core().await;

    let command_id = Some("create-77".to_string());
    let first = ractor::call!(core.orchestrator, |reply| {
        conversator::actors::OrchestratorMsg::CreateTask {
            title: "once".to_string(),
            priority: shared_types::Priority::Normal,
            command_id: command_id.clone(),
            reply,
        }
    })
    .unwrap()
    .unwrap();

    let replay = ractor::call!(core.orchestrator, |reply| {
        conversator::actors::OrchestratorMsg::CreateTask {
            title: "twice".to_string(),
            priority: shared_types::Priority::High,
            command_id,
            reply,
        }
    })
    .unwrap()
    .unwrap();

    assert_eq!(first.task_id, replay.task_id);
    assert_eq!(replay.title, "once");
    assert_eq!(event_types(&core).await.len(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn questions_only_valid_while_refining() {
    let core = boot_core().await;
    let task = create_task(&core, "x").await;

    // Still in draft: no working prompt update yet.
    let result = ractor::call!(core.orchestrator, |reply| {
        conversator::actors::OrchestratorMsg::RaiseQuestions {
            task_id: task.task_id.clone(),
            questions: vec!["?".to_string()],
            command_id: None,
            reply,
        }
    })
    .unwrap();
    assert!(matches!(result, Err(conversator::actors::CommandError::Conflict(_))));

    core.shutdown().await;
}
