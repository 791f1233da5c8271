//! Task snapshot and command endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use shared_types::{GateDecision, Priority, TaskStatus};

use crate::actors::{EventStoreMsg, OrchestratorMsg};
use crate::prompts::WorkingPromptPatch;

use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(crate::actors::CommandError::Validation)?,
        ),
        None => None,
    };
    let tasks = ractor::call!(state.app.event_store(), |reply| EventStoreMsg::ListTasks {
        status,
        reply
    })?;
    Ok(Json(json!({ "tasks": tasks, "total": tasks.len() })))
}

pub async fn get_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = ractor::call!(state.app.event_store(), |reply| EventStoreMsg::GetTask {
        task_id: task_id.clone(),
        reply
    })?
    .ok_or_else(|| crate::actors::CommandError::NotFound(format!("task {task_id}")))?;

    let events = ractor::call!(state.app.event_store(), |reply| EventStoreMsg::GetEvents {
        task_id: Some(task_id),
        since_seq: 0,
        limit: 200,
        reply
    })?
    .map_err(crate::actors::CommandError::from)?;

    Ok(Json(json!({ "task": task, "events": events })))
}

#[derive(Debug, Deserialize)]
pub struct TaskEventsQuery {
    #[serde(default)]
    pub since_seq: i64,
    #[serde(default = "default_event_limit")]
    pub limit: i64,
}

fn default_event_limit() -> i64 {
    200
}

pub async fn task_events(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Query(query): Query<TaskEventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = ractor::call!(state.app.event_store(), |reply| EventStoreMsg::GetEvents {
        task_id: Some(task_id),
        since_seq: query.since_seq,
        limit: query.limit,
        reply
    })?
    .map_err(crate::actors::CommandError::from)?;
    Ok(Json(json!({ "events": events })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub title: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn create_task(
    State(state): State<ApiState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let task = ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::CreateTask {
        title: body.title,
        priority: body.priority,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromptBody {
    pub delta_summary: String,
    #[serde(flatten)]
    pub patch: WorkingPromptPatch,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn update_working_prompt(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<UpdatePromptBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let path = ractor::call!(state.app.orchestrator(), |reply| {
        OrchestratorMsg::UpdateWorkingPrompt {
            task_id,
            delta_summary: body.delta_summary,
            patch: body.patch,
            command_id: body.command_id,
            reply,
        }
    })??;
    Ok(Json(json!({ "working_prompt_path": path })))
}

#[derive(Debug, Deserialize)]
pub struct QuestionsBody {
    pub questions: Vec<String>,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn raise_questions(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<QuestionsBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::RaiseQuestions {
        task_id,
        questions: body.questions,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AnswersBody {
    pub answers: Value,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn answer_questions(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<AnswersBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::AnswerQuestions {
        task_id,
        answers: body.answers,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct FreezeBody {
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn freeze_prompt(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    body: Option<Json<FreezeBody>>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let command_id = body.and_then(|Json(b)| b.command_id);
    let paths = ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::FreezePrompt {
        task_id,
        command_id,
        reply
    })??;
    Ok(Json(json!(paths)))
}

#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub builder_kind: String,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn dispatch(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<DispatchBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let outcome = ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::Dispatch {
        task_id,
        builder_kind: body.builder_kind,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct GateBody {
    pub decision: GateDecision,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn resolve_gate(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<GateBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::ResolveGate {
        task_id,
        decision: body.decision,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
    #[serde(default)]
    pub command_id: Option<String>,
}

fn default_cancel_reason() -> String {
    "user requested".to_string()
}

pub async fn cancel(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::Cancel {
        task_id,
        reason: body.reason,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct LinkBody {
    pub external_task_id: String,
    #[serde(default)]
    pub command_id: Option<String>,
}

pub async fn link_external(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<LinkBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::LinkExternal {
        task_id,
        external_task_id: body.external_task_id,
        command_id: body.command_id,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}
