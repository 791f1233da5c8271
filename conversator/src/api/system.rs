//! Health and status endpoints.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::actors::EventStoreMsg;

use super::{ApiError, ApiState};

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "conversator-core",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The single read surface consumed by the voice layer's `get_status` tool:
/// active tasks, unread counter, builder health, in one call.
pub async fn get_status(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let snapshot =
        ractor::call!(state.app.event_store(), |reply| EventStoreMsg::Snapshot { reply })?;
    let unread =
        ractor::call!(state.app.event_store(), |reply| EventStoreMsg::UnreadCount { reply })?;
    let builders = state.app.registry().health_all().await;

    let active: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| {
            json!({
                "task_id": t.task_id,
                "title": t.title,
                "status": t.status,
                "priority": t.priority,
                "builder_session_id": t.builder_session_id,
            })
        })
        .collect();

    Ok(Json(json!({
        "active_tasks": active,
        "active_count": active.len(),
        "unread_count": unread,
        "builders": builders,
        "last_seq": snapshot.last_seq,
    })))
}
