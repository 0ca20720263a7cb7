//! Per-frame dispatch for one WebSocket connection.
//!
//! Each incoming frame runs through: rate-limit check → envelope parse →
//! dispatch by `type` with payload validation. Failures surface as exactly
//! one error frame carrying the request's correlation id; session-scoped
//! operations use `session.error`, everything else uses `error`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::identity::Principal;
use crate::notify::{Notification, NotifyKind};
use crate::protocol::Envelope;
use crate::ratelimit::ClientId;
use crate::sessions::{CreateOpts, Subscription};
use crate::state::AppState;
use crate::store::prefs::NotificationPrefs;

/// A live attachment: dropping the subscriptions cancels them.
pub struct Attachment {
    pub session_id: String,
    _data_sub: Subscription,
    _exit_sub: Subscription,
}

/// Per-connection context threaded through the dispatch functions.
pub struct ConnCtx {
    pub client_id: ClientId,
    pub principal: Principal,
    /// Outbound frame queue, drained by the connection's writer task.
    pub tx: mpsc::Sender<Envelope>,
    /// Control channel poked by the exit subscriber so the select loop can
    /// release the attachment when the shell dies.
    pub exit_ctl: mpsc::Sender<String>,
    pub attached: Option<Attachment>,
}

impl ConnCtx {
    fn owner(&self) -> Option<String> {
        if self.principal.user_id == "anonymous" {
            None
        } else {
            Some(self.principal.user_id.clone())
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePayload {
    name: Option<String>,
    shell: Option<String>,
    cwd: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    env: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRef {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenamePayload {
    session_id: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovePayload {
    session_id: String,
    category_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPayload {
    session_id: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizePayload {
    session_id: String,
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryNamePayload {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryRef {
    category_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoryRenamePayload {
    category_id: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderEntry {
    id: String,
    sort_order: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorderPayload {
    order: Vec<ReorderEntry>,
}

fn payload<T: serde::de::DeserializeOwned>(env: &Envelope) -> Result<T> {
    let value = env
        .payload
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|e| Error::InvalidInput(format!("invalid payload: {e}")))
}

/// Entry point for one incoming text frame.
pub async fn process_frame(state: &AppState, ctx: &mut ConnCtx, text: &str) {
    if !state.rate_limiter.try_acquire(ctx.client_id) {
        let _ = ctx
            .tx
            .send(Envelope::error("error", None, &Error::RateLimited))
            .await;
        return;
    }

    let env = match Envelope::parse(text) {
        Ok(env) => env,
        Err(err) => {
            let _ = ctx.tx.send(Envelope::error("error", None, &err)).await;
            return;
        }
    };

    let kind = env.kind.clone();
    let id = env.id.clone();
    if let Err(err) = dispatch(state, ctx, env).await {
        // Category lookups always report on the generic channel, even when
        // reached through session.move.
        let error_kind = if kind.starts_with("session.") && !matches!(err, Error::CategoryNotFound)
        {
            "session.error"
        } else {
            "error"
        };
        let _ = ctx
            .tx
            .send(Envelope::error(error_kind, id.as_deref(), &err))
            .await;
    }
}

async fn dispatch(state: &AppState, ctx: &mut ConnCtx, env: Envelope) -> Result<()> {
    let id_owned = env.id.clone();
    let id = id_owned.as_deref();

    match env.kind.as_str() {
        // Identity is resolved at upgrade time; `auth` just re-acks.
        "auth" => {
            send(ctx, Envelope::reply(
                "auth.success",
                id,
                json!({ "principal": &ctx.principal }),
            ))
            .await
        }
        "ping" => send(ctx, Envelope::reply("pong", id, json!({}))).await,

        "session.list" => {
            let sessions = state.session_manager.list().await?;
            send(ctx, Envelope::reply("session.list", id, json!({ "sessions": sessions }))).await
        }
        "session.create" => {
            let p: CreatePayload = payload(&env)?;
            let record = state
                .session_manager
                .create(CreateOpts {
                    name: p.name,
                    shell: p.shell,
                    cwd: p.cwd,
                    cols: p.cols,
                    rows: p.rows,
                    owner: ctx.owner(),
                    env: p.env.unwrap_or_default(),
                })
                .await?;

            let item = crate::sessions::SessionListItem {
                record: record.clone(),
                attachable: true,
            };
            let session_json = json!({ "session": item });
            send(ctx, Envelope::reply("session.created", id, session_json.clone())).await?;
            state.broadcast(
                Envelope::event("session.created", session_json),
                Some(ctx.client_id),
            );

            // Detach from any previous session before wiring the new one so
            // the old data subscription cannot leak into this attachment.
            release_attachment(state, ctx).await;
            do_attach(state, ctx, &record.id, id).await
        }
        "session.attach" => {
            let p: SessionRef = payload(&env)?;
            do_attach(state, ctx, &p.session_id, id).await
        }
        "session.detach" => {
            let p: SessionRef = payload(&env)?;
            if ctx
                .attached
                .as_ref()
                .is_some_and(|a| a.session_id == p.session_id)
            {
                release_attachment(state, ctx).await;
            }
            send(ctx, Envelope::reply(
                "session.detached",
                id,
                json!({ "sessionId": p.session_id }),
            ))
            .await
        }
        "session.terminate" => {
            let p: SessionRef = payload(&env)?;
            if !state.session_manager.terminate(&p.session_id).await? {
                return Err(Error::SessionNotFound(p.session_id));
            }
            if ctx
                .attached
                .as_ref()
                .is_some_and(|a| a.session_id == p.session_id)
            {
                release_attachment(state, ctx).await;
            }
            let payload = json!({ "sessionId": p.session_id });
            send(ctx, Envelope::reply("session.terminated", id, payload.clone())).await?;
            state.broadcast(Envelope::event("session.terminated", payload), None);
            Ok(())
        }
        "session.delete" => {
            let p: SessionRef = payload(&env)?;
            if ctx
                .attached
                .as_ref()
                .is_some_and(|a| a.session_id == p.session_id)
            {
                release_attachment(state, ctx).await;
            }
            state.session_manager.delete(&p.session_id).await?;
            let payload = json!({ "sessionId": p.session_id });
            send(ctx, Envelope::reply("session.deleted", id, payload.clone())).await?;
            state.broadcast(
                Envelope::event("session.deleted", payload),
                Some(ctx.client_id),
            );
            Ok(())
        }
        "session.rename" => {
            let p: RenamePayload = payload(&env)?;
            state.session_manager.rename(&p.session_id, &p.name).await?;
            let payload = json!({ "sessionId": p.session_id, "name": p.name.trim() });
            send(ctx, Envelope::reply("session.renamed", id, payload.clone())).await?;
            state.broadcast(
                Envelope::event("session.renamed", payload),
                Some(ctx.client_id),
            );
            Ok(())
        }
        "session.move" => {
            let p: MovePayload = payload(&env)?;
            state
                .session_manager
                .move_to_category(&p.session_id, p.category_id.as_deref())
                .await?;
            let payload = json!({ "sessionId": p.session_id, "categoryId": p.category_id });
            send(ctx, Envelope::reply("session.moved", id, payload.clone())).await?;
            state.broadcast(Envelope::event("session.moved", payload), None);
            Ok(())
        }

        "terminal.data" => {
            let p: DataPayload = payload(&env)?;
            if !ctx
                .attached
                .as_ref()
                .is_some_and(|a| a.session_id == p.session_id)
            {
                return Err(Error::InvalidInput(
                    "Not attached to this session".to_string(),
                ));
            }
            state
                .session_manager
                .write(&p.session_id, p.data.as_bytes())
                .await
        }
        "terminal.resize" => {
            let p: ResizePayload = payload(&env)?;
            if !ctx
                .attached
                .as_ref()
                .is_some_and(|a| a.session_id == p.session_id)
            {
                // Stale resize from a previous attachment; drop it quietly.
                return Ok(());
            }
            state
                .session_manager
                .resize(&p.session_id, p.cols, p.rows)
                .await
        }

        "category.list" => {
            let categories = state.categories.list().await?;
            send(ctx, Envelope::reply(
                "category.list",
                id,
                json!({ "categories": categories }),
            ))
            .await
        }
        "category.create" => {
            let p: CategoryNamePayload = payload(&env)?;
            let record = state
                .categories
                .create(&p.name, ctx.owner().as_deref())
                .await?;
            let payload = json!({ "category": record });
            send(ctx, Envelope::reply("category.created", id, payload.clone())).await?;
            state.broadcast(
                Envelope::event("category.created", payload),
                Some(ctx.client_id),
            );
            Ok(())
        }
        "category.rename" => {
            let p: CategoryRenamePayload = payload(&env)?;
            state.categories.rename(&p.category_id, &p.name).await?;
            let payload = json!({ "categoryId": p.category_id, "name": p.name.trim() });
            send(ctx, Envelope::reply("category.renamed", id, payload.clone())).await?;
            state.broadcast(
                Envelope::event("category.renamed", payload),
                Some(ctx.client_id),
            );
            Ok(())
        }
        "category.delete" => {
            let p: CategoryRef = payload(&env)?;
            state.categories.delete(&p.category_id).await?;
            let payload = json!({ "categoryId": p.category_id });
            send(ctx, Envelope::reply("category.deleted", id, payload.clone())).await?;
            state.broadcast(
                Envelope::event("category.deleted", payload),
                Some(ctx.client_id),
            );
            Ok(())
        }
        "category.reorder" => {
            let p: ReorderPayload = payload(&env)?;
            let ordering: Vec<(String, i64)> =
                p.order.into_iter().map(|e| (e.id, e.sort_order)).collect();
            state.categories.reorder(&ordering).await?;
            let categories = state.categories.list().await?;
            let payload = json!({ "categories": categories });
            send(ctx, Envelope::reply("category.reordered", id, payload.clone())).await?;
            state.broadcast(Envelope::event("category.reordered", payload), None);
            Ok(())
        }
        "category.toggle" => {
            let p: CategoryRef = payload(&env)?;
            let collapsed = state.categories.toggle(&p.category_id).await?;
            let payload = json!({ "categoryId": p.category_id, "collapsed": collapsed });
            send(ctx, Envelope::reply("category.toggled", id, payload.clone())).await?;
            state.broadcast(Envelope::event("category.toggled", payload), None);
            Ok(())
        }

        "notification.preferences.get" => {
            let prefs = state.categories.get_prefs(&ctx.principal.user_id).await?;
            send(ctx, Envelope::reply(
                "notification.preferences",
                id,
                json!({ "preferences": prefs }),
            ))
            .await
        }
        "notification.preferences.set" => {
            let prefs: NotificationPrefs = payload(&env)?;
            state
                .categories
                .set_prefs(&ctx.principal.user_id, prefs)
                .await?;
            send(ctx, Envelope::reply(
                "notification.preferences.updated",
                id,
                json!({ "preferences": prefs }),
            ))
            .await
        }
        "notification.dismiss" => {
            let p: SessionRef = payload(&env)?;
            state.notifications.clear(&p.session_id);
            Ok(())
        }

        other => Err(Error::InvalidInput(format!("Unknown message type: {other}"))),
    }
}

/// Attach this connection to a session, replacing any current attachment.
///
/// Live sessions get a consistent snapshot-plus-subscription under the
/// session lock; terminated or unloaded sessions reply with the stored
/// scrollback blob and no subscriptions. Attaching to the session already
/// attached re-sends the view without duplicating subscription tokens.
async fn do_attach(
    state: &AppState,
    ctx: &mut ConnCtx,
    session_id: &str,
    reply_id: Option<&str>,
) -> Result<()> {
    let mgr = &state.session_manager;

    if ctx
        .attached
        .as_ref()
        .is_some_and(|a| a.session_id == session_id)
    {
        let item = mgr
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let scrollback = mgr.get_scrollback(session_id).await?;
        return send(ctx, Envelope::reply(
            "session.attached",
            reply_id,
            json!({ "session": item, "scrollback": scrollback }),
        ))
        .await;
    }

    let mut item = mgr
        .get(session_id)
        .await?
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
    // A multiplexer-backed session can come back after a server restart.
    let live = item.attachable || mgr.revive(session_id).await?;

    release_attachment(state, ctx).await;
    state.notifications.clear(session_id);

    if live {
        let data_tx = ctx.tx.clone();
        let data_sid = session_id.to_string();
        let data_fn: crate::sessions::DataFn = Arc::new(move |bytes: &[u8]| {
            let frame = Envelope::event(
                "terminal.data",
                json!({
                    "sessionId": &data_sid,
                    "data": String::from_utf8_lossy(bytes),
                }),
            );
            if let Err(mpsc::error::TrySendError::Full(_)) = data_tx.try_send(frame) {
                warn!("Outbound queue full, dropping terminal.data for {data_sid}");
            }
        });

        let exit_tx = ctx.tx.clone();
        let exit_ctl = ctx.exit_ctl.clone();
        let exit_sid = session_id.to_string();
        let exit_fn: crate::sessions::ExitFn = Arc::new(move |code: i32| {
            let frame = Envelope::event(
                "terminal.exit",
                json!({ "sessionId": &exit_sid, "exitCode": code }),
            );
            let _ = exit_tx.try_send(frame);
            let _ = exit_ctl.try_send(exit_sid.clone());
        });

        item.attachable = true;
        item.record.status = "active".to_string();
        let reply_tx = ctx.tx.clone();
        let reply_id_owned = reply_id.map(ToString::to_string);
        let item_json = serde_json::to_value(&item).expect("session item serializes");
        let (data_sub, exit_sub) = mgr
            .attach_with_history(
                session_id,
                ctx.client_id,
                move |scrollback| {
                    let frame = Envelope::reply(
                        "session.attached",
                        reply_id_owned.as_deref(),
                        json!({ "session": item_json, "scrollback": scrollback }),
                    );
                    if reply_tx.try_send(frame).is_err() {
                        warn!("Outbound queue full, dropping session.attached reply");
                    }
                },
                data_fn,
                exit_fn,
            )
            .await?;

        ctx.attached = Some(Attachment {
            session_id: session_id.to_string(),
            _data_sub: data_sub,
            _exit_sub: exit_sub,
        });
        return Ok(());
    }

    // History-only view of a terminated (or unrestorable) session.
    let scrollback = mgr.get_scrollback(session_id).await?;
    send(ctx, Envelope::reply(
        "session.attached",
        reply_id,
        json!({ "session": item, "scrollback": scrollback }),
    ))
    .await
}

/// Release the current attachment: cancel both subscriptions (via drop) and
/// detach the client from the session's bookkeeping.
pub async fn release_attachment(state: &AppState, ctx: &mut ConnCtx) {
    if let Some(attachment) = ctx.attached.take() {
        if let Err(e) = state
            .session_manager
            .detach_client(&attachment.session_id, ctx.client_id)
            .await
        {
            warn!(
                "Detach bookkeeping for {} failed: {e}",
                attachment.session_id
            );
        }
    }
}

/// The attached shell exited; drop the dead attachment silently.
pub async fn on_session_exit(state: &AppState, ctx: &mut ConnCtx, session_id: &str) {
    if ctx
        .attached
        .as_ref()
        .is_some_and(|a| a.session_id == session_id)
    {
        release_attachment(state, ctx).await;
    }
}

/// Another client terminated or deleted the session we are attached to.
pub async fn observe_broadcast(state: &AppState, ctx: &mut ConnCtx, frame: &Envelope) {
    if frame.kind != "session.terminated" && frame.kind != "session.deleted" {
        return;
    }
    let Some(sid) = frame
        .payload
        .as_ref()
        .and_then(|p| p.get("sessionId"))
        .and_then(|v| v.as_str())
    else {
        return;
    };
    if ctx.attached.as_ref().is_some_and(|a| a.session_id == sid) {
        release_attachment(state, ctx).await;
    }
}

/// Deliver a hook notification if this connection's principal has the kind
/// enabled. Preference reads fall back to defaults on store errors.
pub async fn deliver_notification(state: &AppState, ctx: &ConnCtx, notification: &Notification) {
    let prefs = state
        .categories
        .get_prefs(&ctx.principal.user_id)
        .await
        .unwrap_or_default();
    let enabled = match notification.kind {
        NotifyKind::NeedsInput => prefs.notify_on_input,
        NotifyKind::Completed => prefs.notify_on_completed,
    };
    if !enabled {
        return;
    }
    let frame = Envelope::event(
        "notification",
        json!({
            "sessionId": &notification.session_id,
            "type": notification.kind.as_str(),
            "timestamp": notification.timestamp_ms,
        }),
    );
    let _ = ctx.tx.send(frame).await;
}

async fn send(ctx: &ConnCtx, frame: Envelope) -> Result<()> {
    // A send failure means the connection is closing; the frame is dropped
    // silently per the cancellation rules.
    let _ = ctx.tx.send(frame).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;
    use crate::identity::AnonymousProvider;
    use crate::notify::NotificationBus;
    use crate::ratelimit::RateLimiter;
    use crate::sessions::persist::PersistMode;
    use crate::sessions::SessionManager;
    use crate::store::MetadataStore;
    use crate::{AppState, CategoryService};

    async fn test_state(max_sessions: usize, limiter: RateLimiter) -> AppState {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut config = Config::default();
        config.sessions.max_sessions = max_sessions;
        config.sessions.default_shell = "/bin/sh".to_string();
        config.sessions.default_working_dir = "/tmp".to_string();
        let config = Arc::new(config);
        let manager = SessionManager::new(store.clone(), PersistMode::StoredScrollback, &config);
        AppState::new(
            config,
            manager,
            CategoryService::new(store),
            Arc::new(AnonymousProvider),
            Arc::new(limiter),
            Arc::new(NotificationBus::new()),
        )
    }

    fn test_ctx(client_id: u64) -> (ConnCtx, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(256);
        let (exit_ctl, _exit_rx) = mpsc::channel(8);
        (
            ConnCtx {
                client_id,
                principal: Principal::anonymous(),
                tx,
                exit_ctl,
                attached: None,
            },
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn create_replies_created_then_attached_with_empty_scrollback() {
        let state = test_state(5, RateLimiter::new()).await;
        let (mut ctx, mut rx) = test_ctx(1);

        process_frame(
            &state,
            &mut ctx,
            r#"{"type":"session.create","id":"1","payload":{"name":"T","cols":80,"rows":24}}"#,
        )
        .await;

        let created = recv(&mut rx).await;
        assert_eq!(created.kind, "session.created");
        assert_eq!(created.id.as_deref(), Some("1"));
        let session = &created.payload.as_ref().unwrap()["session"];
        let sid = session["id"].as_str().unwrap().to_string();
        assert_eq!(session["name"], "T");

        let attached = recv(&mut rx).await;
        assert_eq!(attached.kind, "session.attached");
        assert_eq!(attached.payload.as_ref().unwrap()["scrollback"], "");
        assert_eq!(
            attached.payload.as_ref().unwrap()["session"]["id"]
                .as_str()
                .unwrap(),
            sid
        );
        assert_eq!(ctx.attached.as_ref().unwrap().session_id, sid);

        state.session_manager.shutdown().await;
    }

    #[tokio::test]
    async fn quota_error_carries_limit_and_correlation_id() {
        let state = test_state(1, RateLimiter::new()).await;
        let (mut ctx, mut rx) = test_ctx(1);

        process_frame(
            &state,
            &mut ctx,
            r#"{"type":"session.create","id":"a","payload":{}}"#,
        )
        .await;
        recv(&mut rx).await; // session.created
        recv(&mut rx).await; // session.attached

        process_frame(
            &state,
            &mut ctx,
            r#"{"type":"session.create","id":"b","payload":{}}"#,
        )
        .await;
        let err = recv(&mut rx).await;
        assert_eq!(err.kind, "session.error");
        assert_eq!(err.id.as_deref(), Some("b"));
        let message = err.payload.as_ref().unwrap()["message"].as_str().unwrap();
        assert!(message.contains("Maximum session limit (1) reached"));

        state.session_manager.shutdown().await;
    }

    #[tokio::test]
    async fn move_to_unknown_category_reports_plain_error() {
        let state = test_state(5, RateLimiter::new()).await;
        let (mut ctx, mut rx) = test_ctx(1);

        process_frame(
            &state,
            &mut ctx,
            r#"{"type":"session.create","id":"1","payload":{}}"#,
        )
        .await;
        let created = recv(&mut rx).await;
        let sid = created.payload.as_ref().unwrap()["session"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        recv(&mut rx).await; // session.attached

        let frame = format!(
            r#"{{"type":"session.move","id":"2","payload":{{"sessionId":"{sid}","categoryId":"does-not-exist"}}}}"#
        );
        process_frame(&state, &mut ctx, &frame).await;
        let err = recv(&mut rx).await;
        assert_eq!(err.kind, "error");
        assert_eq!(err.id.as_deref(), Some("2"));
        assert_eq!(
            err.payload.as_ref().unwrap()["message"].as_str().unwrap(),
            "Category not found"
        );

        // Durable category assignment is unchanged.
        let item = state.session_manager.get(&sid).await.unwrap().unwrap();
        assert!(item.record.category_id.is_none());

        state.session_manager.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limit_rejects_fourth_burst_request() {
        let state = test_state(5, RateLimiter::with_params(3, Duration::from_secs(10))).await;
        let (mut ctx, mut rx) = test_ctx(1);

        for _ in 0..4 {
            process_frame(&state, &mut ctx, r#"{"type":"ping"}"#).await;
        }
        let mut pongs = 0;
        let mut limited = 0;
        for _ in 0..4 {
            let frame = recv(&mut rx).await;
            match frame.kind.as_str() {
                "pong" => pongs += 1,
                "error" => {
                    limited += 1;
                    let message =
                        frame.payload.as_ref().unwrap()["message"].as_str().unwrap();
                    assert!(message.contains("Rate limit exceeded"));
                }
                other => panic!("unexpected frame {other}"),
            }
        }
        assert_eq!(pongs, 3);
        assert_eq!(limited, 1);
    }

    #[tokio::test]
    async fn notification_gating_respects_preferences() {
        let state = test_state(5, RateLimiter::new()).await;
        let (ctx, mut rx) = test_ctx(1);

        let prefs = NotificationPrefs {
            notify_on_completed: false,
            ..NotificationPrefs::default()
        };
        state
            .categories
            .set_prefs(&ctx.principal.user_id, prefs)
            .await
            .unwrap();

        let completed = Notification {
            session_id: "s1".to_string(),
            kind: NotifyKind::Completed,
            timestamp_ms: 1,
        };
        deliver_notification(&state, &ctx, &completed).await;

        let needs_input = Notification {
            session_id: "s1".to_string(),
            kind: NotifyKind::NeedsInput,
            timestamp_ms: 2,
        };
        deliver_notification(&state, &ctx, &needs_input).await;

        // Only the needs-input event gets through.
        let frame = recv(&mut rx).await;
        assert_eq!(frame.kind, "notification");
        assert_eq!(frame.payload.as_ref().unwrap()["type"], "needs-input");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_data_requires_matching_attachment() {
        let state = test_state(5, RateLimiter::new()).await;
        let (mut ctx, mut rx) = test_ctx(1);

        process_frame(
            &state,
            &mut ctx,
            r#"{"type":"terminal.data","payload":{"sessionId":"nope","data":"ls\r"}}"#,
        )
        .await;
        let err = recv(&mut rx).await;
        assert_eq!(err.kind, "error");
        assert!(err.payload.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("Not attached"));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_rejected() {
        let state = test_state(5, RateLimiter::new()).await;
        let (mut ctx, mut rx) = test_ctx(1);

        process_frame(&state, &mut ctx, "not json").await;
        assert_eq!(recv(&mut rx).await.kind, "error");

        process_frame(&state, &mut ctx, r#"{"id":"1"}"#).await;
        assert_eq!(recv(&mut rx).await.kind, "error");

        process_frame(&state, &mut ctx, r#"{"type":"warp.core","id":"9"}"#).await;
        let err = recv(&mut rx).await;
        assert_eq!(err.kind, "error");
        assert_eq!(err.id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn reattach_preserves_history() {
        let state = test_state(5, RateLimiter::new()).await;
        let (mut ctx_a, mut rx_a) = test_ctx(1);

        process_frame(
            &state,
            &mut ctx_a,
            r#"{"type":"session.create","id":"1","payload":{}}"#,
        )
        .await;
        let created = recv(&mut rx_a).await;
        let sid = created.payload.as_ref().unwrap()["session"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        recv(&mut rx_a).await; // session.attached

        // Client A types a command and waits for the echo to land.
        let data = format!(
            r#"{{"type":"terminal.data","payload":{{"sessionId":"{sid}","data":"echo history-marker\r"}}}}"#
        );
        process_frame(&state, &mut ctx_a, &data).await;
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if state
                .session_manager
                .get_scrollback(&sid)
                .await
                .unwrap()
                .contains("history-marker")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Client A goes away; client B lists and attaches.
        release_attachment(&state, &mut ctx_a).await;
        let (mut ctx_b, mut rx_b) = test_ctx(2);
        process_frame(&state, &mut ctx_b, r#"{"type":"session.list","id":"L"}"#).await;
        let list = recv(&mut rx_b).await;
        let sessions = list.payload.as_ref().unwrap()["sessions"].as_array().unwrap();
        let entry = sessions.iter().find(|s| s["id"] == sid.as_str()).unwrap();
        assert_eq!(entry["attachable"], true);

        let attach = format!(
            r#"{{"type":"session.attach","id":"A","payload":{{"sessionId":"{sid}"}}}}"#
        );
        process_frame(&state, &mut ctx_b, &attach).await;
        let attached = recv(&mut rx_b).await;
        assert_eq!(attached.kind, "session.attached");
        assert_eq!(attached.id.as_deref(), Some("A"));
        assert!(attached.payload.as_ref().unwrap()["scrollback"]
            .as_str()
            .unwrap()
            .contains("history-marker"));

        state.session_manager.shutdown().await;
    }
}
