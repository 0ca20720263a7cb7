//! WebSocket transport: one task per connected client.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws` (optionally `?user=<login>` when the
//!    allowlist provider is active). The peer is resolved to a principal
//!    before any frame is processed; rejection closes with code 4001.
//! 2. On success the server pushes `auth.success` with the principal and
//!    any pending notification badges.
//! 3. All frames are JSON envelopes (see [`crate::protocol`]). Binary
//!    frames are rejected with an error frame.
//! 4. Outgoing frames funnel through one bounded mpsc channel drained by a
//!    writer task, serializing transport writes per client. PTY fan-out
//!    enqueues with `try_send` and never blocks the reader.
//! 5. On disconnect the handler detaches from its session, cancels both
//!    subscription tokens, and releases its rate-limiter bucket.
//!
//! ## Message types (client → server)
//!
//! `auth`, `ping`, `session.{list,create,attach,detach,terminate,delete,
//! rename,move}`, `terminal.{data,resize}`, `category.{list,create,rename,
//! delete,reorder,toggle}`, `notification.preferences.{get,set}`,
//! `notification.dismiss`
//!
//! ## Message types (server → client)
//!
//! `auth.{success,failure}`, `pong`, `session.{list,created,attached,
//! detached,terminated,deleted,renamed,moved,error}`, `terminal.{data,exit}`,
//! `category.{list,created,renamed,deleted,reordered,toggled}`,
//! `notification.preferences`, `notification.preferences.updated`,
//! `notification`, `error`

pub mod handlers;

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::protocol::Envelope;
use crate::state::AppState;

/// Close code sent when the identity gate rejects the peer.
const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Outbound frame queue depth per client. Fan-out drops frames for a
/// client whose queue stays full (see DESIGN.md).
const OUTBOUND_QUEUE: usize = 256;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Login name hint forwarded by the front-door (allowlist mode).
    pub user: Option<String>,
}

/// `GET /ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, peer, query.user))
}

/// Main per-connection loop: resolve identity, then multiplex incoming
/// frames, lifecycle broadcasts, hook notifications, and exit signals.
async fn handle_ws(
    mut socket: WebSocket,
    state: AppState,
    peer: SocketAddr,
    login_hint: Option<String>,
) {
    let principal = match state.identity.resolve(peer, login_hint.as_deref()) {
        Ok(principal) => principal,
        Err(_) => {
            let failure = Envelope::event("auth.failure", json!({ "reason": "Unauthorized" }));
            let _ = socket.send(Message::Text(failure.to_text().into())).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "Unauthorized".into(),
                })))
                .await;
            info!("Rejected connection from {peer}");
            return;
        }
    };

    let client_id = state.assign_client_id();
    info!("Client {client_id} connected ({}, {peer})", principal.user_id);

    let (mut ws_sink, mut ws_stream) = socket.split();

    // All outgoing frames pass through this queue; a single writer task
    // serializes the transport writes.
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    // Poked by the exit subscriber so the loop can drop a dead attachment.
    let (exit_ctl_tx, mut exit_ctl_rx) = mpsc::channel::<String>(8);

    let mut events_rx = state.events.subscribe();
    let mut notify_rx = state.notifications.subscribe();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sink
                .send(Message::Text(frame.to_text().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let _ = tx
        .send(Envelope::event(
            "auth.success",
            json!({
                "principal": &principal,
                "notifications": state.notifications.snapshot(),
            }),
        ))
        .await;

    let mut ctx = handlers::ConnCtx {
        client_id,
        principal,
        tx: tx.clone(),
        exit_ctl: exit_ctl_tx,
        attached: None,
    };

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => {
                        handlers::process_frame(&state, &mut ctx, text.as_str()).await;
                    }
                    Message::Binary(_) => {
                        let err = Error::InvalidInput("Binary frames are not supported".into());
                        let _ = ctx.tx.send(Envelope::error("error", None, &err)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        if event.exclude == Some(client_id) {
                            continue;
                        }
                        handlers::observe_broadcast(&state, &mut ctx, &event.frame).await;
                        if ctx.tx.send(event.frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {client_id} lagged {n} broadcast frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            notification = notify_rx.recv() => {
                match notification {
                    Ok(notification) => {
                        handlers::deliver_notification(&state, &ctx, &notification).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Client {client_id} lagged {n} notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            exited = exit_ctl_rx.recv() => {
                if let Some(session_id) = exited {
                    handlers::on_session_exit(&state, &mut ctx, &session_id).await;
                }
            }
        }
    }

    // Transport closed: synchronous cleanup from the handler's view.
    handlers::release_attachment(&state, &mut ctx).await;
    state.rate_limiter.remove(client_id);
    send_task.abort();
    info!("Client {client_id} disconnected");
}
