//! Quick-dispatch endpoints.
//!
//! The core classifies and records; the caller (the voice layer) executes
//! allowed commands locally and reports the outcome back.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::actors::{CommandError, OrchestratorMsg};
use crate::quick_dispatch::{QuickOperation, QuickVerdict};

use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct QuickDispatchBody {
    pub operation: String,
    pub command: String,
}

pub async fn quick_dispatch(
    State(state): State<ApiState>,
    Json(body): Json<QuickDispatchBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let operation: QuickOperation =
        body.operation.parse().map_err(CommandError::Validation)?;
    let verdict = ractor::call!(state.app.orchestrator(), |reply| {
        OrchestratorMsg::QuickDispatch { operation, command: body.command.clone(), reply }
    })??;

    Ok(Json(match verdict {
        QuickVerdict::Allowed => json!({
            "allowed": true,
            "command": body.command,
        }),
        QuickVerdict::Blocked { reason } => json!({
            "allowed": false,
            "requires_full_dispatch": true,
            "reason": reason,
            "command": body.command,
        }),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReportBody {
    pub operation: String,
    pub command: String,
    pub success: bool,
    #[serde(default = "default_via")]
    pub via: String,
}

fn default_via() -> String {
    "local".to_string()
}

pub async fn report_result(
    State(state): State<ApiState>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, ApiError> {
    let _permit = state.app.command_permit()?;
    let operation: QuickOperation =
        body.operation.parse().map_err(CommandError::Validation)?;
    ractor::call!(state.app.orchestrator(), |reply| OrchestratorMsg::ReportQuickResult {
        operation,
        command: body.command,
        success: body.success,
        via: body.via,
        reply
    })??;
    Ok(Json(json!({ "ok": true })))
}
