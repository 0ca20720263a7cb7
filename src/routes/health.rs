//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health` — liveness probe.
///
/// Reports the durable session count and which identity provider is
/// active. No authentication required, suitable for load-balancer checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let session_count = state
        .session_manager
        .list()
        .await
        .map(|sessions| sessions.len())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessionCount": session_count,
        "identityProvider": state.identity.status(),
    }))
}
