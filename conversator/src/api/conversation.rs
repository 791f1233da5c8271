//! Conversation/transcript feed endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::conversation::Speaker;

use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub after: u64,
}

pub async fn list_entries(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.app.conversation().entries_after(query.after).await;
    Ok(Json(json!({ "entries": entries, "total": entries.len() })))
}

#[derive(Debug, Deserialize)]
pub struct AppendBody {
    pub speaker: Speaker,
    pub text: String,
    #[serde(default)]
    pub task_id: Option<String>,
}

pub async fn append_entry(
    State(state): State<ApiState>,
    Json(body): Json<AppendBody>,
) -> Result<Json<Value>, ApiError> {
    let entry = state.app.conversation().append(body.speaker, body.text, body.task_id).await;
    Ok(Json(json!({ "entry": entry })))
}
