//! Fan-out HTTP surface.
//!
//! Read-only snapshot endpoints plus the sole write entrypoints into the
//! core (forwarded to the orchestrator), and the `/ws/events` broadcast.
//! Write handlers acquire a command permit first; an exhausted permit pool
//! surfaces as 503 Busy and the caller retries.

pub mod builders;
pub mod conversation;
pub mod inbox;
pub mod quick;
pub mod system;
pub mod tasks;
pub mod websocket;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::actors::CommandError;
use crate::app_state::AppState;

#[derive(Clone)]
pub struct ApiState {
    pub app: AppState,
}

pub fn router() -> Router<ApiState> {
    Router::new()
        // Read surface.
        .route("/api/health", get(system::health))
        .route("/api/status", get(system::get_status))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/{task_id}", get(tasks::get_task))
        .route("/api/tasks/{task_id}/events", get(tasks::task_events))
        .route("/api/inbox", get(inbox::list_inbox))
        .route("/api/inbox/unread/count", get(inbox::unread_count))
        .route("/api/inbox/pending", get(inbox::pending_delivery))
        .route("/api/builders", get(builders::list_builders))
        .route("/api/conversation", get(conversation::list_entries).post(conversation::append_entry))
        // Write surface (forwards to the orchestrator).
        .route("/api/tasks/{task_id}/prompt", post(tasks::update_working_prompt))
        .route("/api/tasks/{task_id}/questions", post(tasks::raise_questions))
        .route("/api/tasks/{task_id}/answers", post(tasks::answer_questions))
        .route("/api/tasks/{task_id}/freeze", post(tasks::freeze_prompt))
        .route("/api/tasks/{task_id}/dispatch", post(tasks::dispatch))
        .route("/api/tasks/{task_id}/gate", post(tasks::resolve_gate))
        .route("/api/tasks/{task_id}/cancel", post(tasks::cancel))
        .route("/api/tasks/{task_id}/link", post(tasks::link_external))
        .route("/api/inbox/acknowledge", post(inbox::acknowledge))
        .route("/api/quick-dispatch", post(quick::quick_dispatch))
        .route("/api/quick-dispatch/report", post(quick::report_result))
        // Live feed.
        .route("/ws/events", get(websocket::ws_handler))
}

/// Command errors mapped onto HTTP statuses.
pub struct ApiError(pub CommandError);

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        ApiError(e)
    }
}

impl<T> From<ractor::RactorErr<T>> for ApiError {
    fn from(e: ractor::RactorErr<T>) -> Self {
        ApiError(CommandError::Internal(e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CommandError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CommandError::NotFound(_) => StatusCode::NOT_FOUND,
            CommandError::Conflict(_) => StatusCode::CONFLICT,
            CommandError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            CommandError::Builder(_) => StatusCode::BAD_GATEWAY,
            CommandError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
