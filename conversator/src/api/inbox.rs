//! Inbox endpoints: list, unread counter, acknowledgement, delivery hints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use shared_types::InboxSeverity;

use crate::actors::{EventStoreMsg, NotifierMsg};

use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct ListInboxQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub severity: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

fn parse_severity(raw: &str) -> Result<InboxSeverity, crate::actors::CommandError> {
    match raw {
        "info" => Ok(InboxSeverity::Info),
        "success" => Ok(InboxSeverity::Success),
        "warning" => Ok(InboxSeverity::Warning),
        "error" => Ok(InboxSeverity::Error),
        "blocking" => Ok(InboxSeverity::Blocking),
        other => Err(crate::actors::CommandError::Validation(format!(
            "unknown severity '{other}'"
        ))),
    }
}

pub async fn list_inbox(
    State(state): State<ApiState>,
    Query(query): Query<ListInboxQuery>,
) -> Result<Json<Value>, ApiError> {
    let severity = query.severity.as_deref().map(parse_severity).transpose()?;
    let items = ractor::call!(state.app.event_store(), |reply| EventStoreMsg::ListInbox {
        unread_only: query.unread_only,
        severity,
        limit: query.limit,
        reply
    })?;
    let unread =
        ractor::call!(state.app.event_store(), |reply| EventStoreMsg::UnreadCount { reply })?;
    Ok(Json(json!({ "items": items, "unread_count": unread, "total": items.len() })))
}

pub async fn unread_count(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let unread =
        ractor::call!(state.app.event_store(), |reply| EventStoreMsg::UnreadCount { reply })?;
    Ok(Json(json!({ "unread_count": unread })))
}

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeBody {
    /// Omit to acknowledge everything unread.
    #[serde(default)]
    pub inbox_ids: Option<Vec<String>>,
}

pub async fn acknowledge(
    State(state): State<ApiState>,
    body: Option<Json<AcknowledgeBody>>,
) -> Result<Json<Value>, ApiError> {
    let ids = body.and_then(|Json(b)| b.inbox_ids);
    let count = ractor::call!(state.app.event_store(), |reply| {
        EventStoreMsg::AcknowledgeInbox { ids, reply }
    })?
    .map_err(crate::actors::CommandError::from)?;
    Ok(Json(json!({ "acknowledged": count })))
}

/// Delivery hints for the voice layer, polled at natural pauses.
pub async fn pending_delivery(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let hints =
        ractor::call!(state.app.notifier(), |reply| NotifierMsg::PollPending { reply })?;
    Ok(Json(json!(hints)))
}
