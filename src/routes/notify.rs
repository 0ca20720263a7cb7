//! Hook ingress for session notifications.
//!
//! Shell hook scripts address this endpoint using the `TTYHUB_SESSION_ID`
//! variable seeded into every session's environment. The endpoint is
//! restricted to loopback peers: hooks run on the host, and requiring the
//! WebSocket identity gate here would force credentials into every shell
//! environment.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::notify::NotifyKind;
use crate::state::AppState;

/// `POST /api/notify/{sessionId}/{kind}` where kind ∈ {needs-input,
/// completed}. 400 on an invalid kind, 403 off-loopback, 200 otherwise.
pub async fn notify(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((session_id, kind)): Path<(String, String)>,
) -> (StatusCode, Json<Value>) {
    if !peer.ip().is_loopback() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Notify hook is loopback-only" })),
        );
    }
    let Some(kind) = NotifyKind::parse(&kind) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Unknown notification kind: {kind}") })),
        );
    };

    debug!("Hook notification: {} {}", session_id, kind.as_str());
    state.notifications.publish(&session_id, kind);
    (StatusCode::OK, Json(json!({ "ok": true })))
}
