//! REST view of the session list.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/sessions` — the durable session list augmented with
/// `attachable` (same shape as the WS `session.list` reply).
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sessions = state.session_manager.list().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string(), "code": e.code() })),
        )
    })?;
    Ok(Json(json!({ "sessions": sessions })))
}
