//! Builder registry snapshot.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::{ApiError, ApiState};

pub async fn list_builders(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let builders = state.app.registry().health_all().await;
    Ok(Json(json!({ "builders": builders })))
}
