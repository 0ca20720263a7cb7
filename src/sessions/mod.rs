//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority over live PTY sessions. It owns
//! every PTY, every scrollback ring, and the per-session table of attached
//! clients; connection handlers interact with sessions only through it.
//!
//! - **Fan-out** — the PTY data callback appends to the ring, then invokes
//!   every data subscriber with the raw bytes. Subscribers must be cheap
//!   (the connection handler's subscriber is a bounded-queue `try_send`).
//! - **Durability** — metadata lives in the [`MetadataStore`]; in-memory
//!   sessions are its transient projection. Without tmux on the host, ring
//!   contents are persisted on terminate/exit/shutdown.
//! - **Quota** — `create` fails once the durable non-terminated count
//!   reaches `sessions.max_sessions`.
//! - **Idle reaping** — sessions with no attached clients for longer than
//!   the configured timeout are terminated by the periodic reaper tick.
//!
//! ## Concurrency
//!
//! The session map is behind a `tokio::sync::RwLock`; `create` holds the
//! write lock across the quota check and insert to prevent TOCTOU races.
//! Per-session mutable state (ring, subscriber tables, attached set, dims)
//! sits under one `std::sync::Mutex` that is never held across an await.

pub mod persist;
pub mod scrollback;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ratelimit::ClientId;
use crate::shell::pty::{PtyProcess, PtySpawnOpts};
use crate::store::sessions::{SessionRecord, SessionStatus};
use crate::store::MetadataStore;
use crate::util::now_ms;
use persist::PersistMode;
use scrollback::ScrollbackRing;

const MAX_NAME_LEN: usize = 100;
const MAX_CWD_LEN: usize = 500;
const MAX_DIM: u16 = 500;
const TOUCH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Callback invoked with each chunk of PTY output.
pub type DataFn = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Callback invoked once with the shell's exit code.
pub type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

/// Options for [`SessionManager::create`].
#[derive(Default)]
pub struct CreateOpts {
    pub name: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub owner: Option<String>,
    pub env: HashMap<String, String>,
}

/// Durable record plus whether a live session backs it right now.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionListItem {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub attachable: bool,
}

enum SubKind {
    Data,
    Exit,
}

/// Cancellable handle for a data or exit subscription.
///
/// Cancelling (or dropping) removes the callback from the session's
/// subscriber table; both are safe after the session is gone.
pub struct Subscription {
    shared: Weak<SessionShared>,
    id: u64,
    kind: SubKind,
}

impl Subscription {
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().expect("session state lock poisoned");
            match self.kind {
                SubKind::Data => {
                    state.data_subs.remove(&self.id);
                }
                SubKind::Exit => {
                    state.exit_subs.remove(&self.id);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// State guarded by the per-session lock.
struct SessionState {
    ring: ScrollbackRing,
    data_subs: HashMap<u64, DataFn>,
    exit_subs: HashMap<u64, ExitFn>,
    attached: HashSet<ClientId>,
    cols: u16,
    rows: u16,
}

struct SessionShared {
    state: Mutex<SessionState>,
    next_sub_id: AtomicU64,
}

/// Debounce state for the durable `last_accessed_at` update.
struct Touch {
    last_persist: Instant,
    dirty: bool,
}

struct LiveSession {
    shared: Arc<SessionShared>,
    pty: PtyProcess,
    mux_handle: Option<String>,
    touch: Mutex<Touch>,
    /// When the attached-client set last became empty (input to the reaper).
    empty_since: Mutex<Option<Instant>>,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, LiveSession>>,
    store: MetadataStore,
    mode: PersistMode,
    max_sessions: usize,
    scrollback_lines: usize,
    idle_timeout: Duration,
    default_shell: String,
    default_cwd: String,
}

/// Manages the pool of live PTY sessions.
///
/// Cloneable; all clones share the same inner state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(store: MetadataStore, mode: PersistMode, config: &Config) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                mode,
                max_sessions: config.sessions.max_sessions,
                scrollback_lines: config.persistence.scrollback_lines,
                idle_timeout: Duration::from_secs(config.sessions.idle_timeout_minutes * 60),
                default_shell: config.sessions.default_shell.clone(),
                default_cwd: config.sessions.default_working_dir.clone(),
            }),
        }
    }

    pub fn persist_mode(&self) -> PersistMode {
        self.inner.mode
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    /// Create a new session: validate, check quota, spawn the PTY, wire the
    /// ring and callbacks, insert durably, then publish to the live table.
    ///
    /// If the durable insert fails the PTY (and any tmux handle) is torn
    /// down before the error surfaces. The map write lock is held across
    /// the quota check and the insert.
    pub async fn create(&self, opts: CreateOpts) -> Result<SessionRecord> {
        let name = match opts.name {
            Some(raw) => validate_name(&raw)?,
            None => "Terminal".to_string(),
        };
        let shell = opts
            .shell
            .unwrap_or_else(|| self.inner.default_shell.clone());
        validate_shell(&shell)?;
        let cwd_raw = opts.cwd.unwrap_or_else(|| self.inner.default_cwd.clone());
        validate_cwd(&cwd_raw)?;
        let cwd = crate::util::expand_tilde(&cwd_raw).into_owned();
        let cols = opts.cols.unwrap_or(80);
        let rows = opts.rows.unwrap_or(24);
        validate_dims(cols, rows)?;

        let mut sessions = self.inner.sessions.write().await;

        let live_count = self.inner.store.count_non_terminated().await?;
        if live_count >= self.inner.max_sessions as i64 {
            return Err(Error::QuotaExceeded(self.inner.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let mux_handle = match self.inner.mode {
            PersistMode::ExternalMux => Some(persist::mux_handle_name(&id)),
            PersistMode::StoredScrollback => None,
        };

        let live = self.spawn_live(
            &id,
            &shell,
            &cwd,
            cols,
            rows,
            opts.env,
            mux_handle.clone(),
        )?;

        let created_at = now_ms() as i64;
        let sort_order = match self.inner.store.max_sort_order(None).await {
            Ok(max) => max + 1,
            Err(e) => {
                self.teardown_failed_spawn(&live).await;
                return Err(e);
            }
        };
        let record = SessionRecord {
            id: id.clone(),
            name,
            shell,
            cwd,
            created_at,
            last_accessed_at: created_at,
            owner_id: opts.owner,
            status: SessionStatus::Active.as_str().to_string(),
            cols,
            rows,
            external_mux_handle: mux_handle,
            category_id: None,
            sort_order,
        };

        if let Err(e) = self.inner.store.insert_session(&record).await {
            self.teardown_failed_spawn(&live).await;
            return Err(e);
        }
        self.log_event(&id, "create", None).await;

        sessions.insert(id.clone(), live);
        info!(
            "Session {id} created (pid {}, mode {:?}), live: {}",
            sessions[&id].pty.pid,
            self.inner.mode,
            sessions.len()
        );
        Ok(record)
    }

    /// Spawn the PTY (directly, or through `tmux new-session -A` when an
    /// external handle is in play) and wire ring + fan-out + exit handling.
    fn spawn_live(
        &self,
        id: &str,
        shell: &str,
        cwd: &str,
        cols: u16,
        rows: u16,
        env: HashMap<String, String>,
        mux_handle: Option<String>,
    ) -> Result<LiveSession> {
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState {
                ring: ScrollbackRing::new(self.inner.scrollback_lines),
                data_subs: HashMap::new(),
                exit_subs: HashMap::new(),
                attached: HashSet::new(),
                cols,
                rows,
            }),
            next_sub_id: AtomicU64::new(1),
        });

        let data_shared = Arc::clone(&shared);
        let on_data: crate::shell::pty::DataCallback = Arc::new(move |bytes: &[u8]| {
            let state = &mut *data_shared.state.lock().expect("session state lock poisoned");
            state.ring.append(bytes);
            for sub in state.data_subs.values() {
                sub(bytes);
            }
        });

        let manager = self.clone();
        let exit_id = id.to_string();
        let on_exit: crate::shell::pty::ExitCallback = Box::new(move |code| {
            tokio::spawn(async move {
                manager.handle_pty_exit(&exit_id, code).await;
            });
        });

        let (program, args) = match &mux_handle {
            // `-A` attaches when the tmux session already exists, so the
            // same spawn path serves create and post-restart revive.
            Some(handle) => (
                "tmux".to_string(),
                vec![
                    "new-session".to_string(),
                    "-A".to_string(),
                    "-s".to_string(),
                    handle.clone(),
                    "-c".to_string(),
                    cwd.to_string(),
                    shell.to_string(),
                ],
            ),
            // Login shell so rc files are sourced, as terminal emulators do.
            None => (shell.to_string(), vec!["-l".to_string()]),
        };

        let pty = PtyProcess::spawn(
            PtySpawnOpts {
                shell: program,
                args,
                cwd: cwd.to_string(),
                cols,
                rows,
                env,
                session_id: id.to_string(),
            },
            on_data,
            on_exit,
        )?;

        Ok(LiveSession {
            shared,
            pty,
            mux_handle,
            touch: Mutex::new(Touch {
                last_persist: Instant::now(),
                dirty: false,
            }),
            empty_since: Mutex::new(Some(Instant::now())),
        })
    }

    async fn teardown_failed_spawn(&self, live: &LiveSession) {
        live.pty.kill();
        if let Some(handle) = &live.mux_handle {
            persist::kill_mux_session(handle).await;
        }
    }

    /// Durable record plus the attachable flag.
    pub async fn get(&self, id: &str) -> Result<Option<SessionListItem>> {
        let Some(record) = self.inner.store.get_session(id).await? else {
            return Ok(None);
        };
        let attachable = self.inner.sessions.read().await.contains_key(id);
        Ok(Some(SessionListItem { record, attachable }))
    }

    /// All durable sessions, each flagged attachable iff live in memory.
    pub async fn list(&self) -> Result<Vec<SessionListItem>> {
        let records = self.inner.store.list_sessions().await?;
        let sessions = self.inner.sessions.read().await;
        Ok(records
            .into_iter()
            .map(|record| {
                let attachable = sessions.contains_key(&record.id);
                SessionListItem { record, attachable }
            })
            .collect())
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(id)
    }

    /// Forward input bytes to the session's PTY and refresh the activity
    /// timestamp. The durable `last_accessed_at` update is debounced to at
    /// most one write per 5 s; failures are swallowed and retried on the
    /// next tick.
    pub async fn write(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let persist_touch = {
            let sessions = self.inner.sessions.read().await;
            let live = sessions
                .get(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            live.pty.write(bytes.to_vec()).await;

            let mut touch = live.touch.lock().expect("touch lock poisoned");
            if touch.last_persist.elapsed() >= TOUCH_DEBOUNCE {
                touch.last_persist = Instant::now();
                touch.dirty = false;
                true
            } else {
                touch.dirty = true;
                false
            }
        };

        if persist_touch {
            if let Err(e) = self.inner.store.touch_session(id, now_ms() as i64).await {
                warn!("Failed to persist last_accessed for {id}: {e}");
            }
        }
        Ok(())
    }

    /// Resize the PTY, the in-memory dimensions, and the durable record.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        validate_dims(cols, rows)?;
        {
            let sessions = self.inner.sessions.read().await;
            let live = sessions
                .get(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            live.pty.resize(cols, rows);
            let mut state = live.shared.state.lock().expect("session state lock poisoned");
            state.cols = cols;
            state.rows = rows;
        }
        self.inner.store.update_session_dims(id, cols, rows).await?;
        Ok(())
    }

    /// Rename a session (live or not) durably.
    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let name = validate_name(name)?;
        if self.inner.store.get_session(id).await?.is_none() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        self.inner.store.rename_session(id, &name).await?;
        self.log_event(id, "rename", Some(&format!("{{\"name\":{}}}", serde_json::json!(name))))
            .await;
        Ok(())
    }

    /// Move a session to a category (or out of any), appending it at the
    /// end of the target scope's sort order.
    pub async fn move_to_category(&self, id: &str, category_id: Option<&str>) -> Result<()> {
        if self.inner.store.get_session(id).await?.is_none() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        if let Some(cat) = category_id {
            if self.inner.store.get_category(cat).await?.is_none() {
                return Err(Error::CategoryNotFound);
            }
        }
        let sort_order = self.inner.store.max_sort_order(category_id).await? + 1;
        self.inner
            .store
            .move_session(id, category_id, sort_order)
            .await?;
        self.log_event(
            id,
            "move",
            Some(&serde_json::json!({ "category_id": category_id }).to_string()),
        )
        .await;
        Ok(())
    }

    /// Terminate a session. For a live one: persist scrollback (fallback
    /// mode), tear down the tmux handle, kill the PTY, drop all listeners
    /// and rings, mark terminated. Returns false when the id is unknown or
    /// already terminated.
    pub async fn terminate(&self, id: &str) -> Result<bool> {
        let removed = self.inner.sessions.write().await.remove(id);

        if let Some(live) = removed {
            if self.inner.mode == PersistMode::StoredScrollback {
                let content = live
                    .shared
                    .state
                    .lock()
                    .expect("session state lock poisoned")
                    .ring
                    .joined();
                if let Err(e) = self.inner.store.save_scrollback(id, &content).await {
                    warn!("Failed to persist scrollback for {id}: {e}");
                }
            }
            if let Some(handle) = &live.mux_handle {
                persist::kill_mux_session(handle).await;
            }
            live.pty.kill();
            self.inner
                .store
                .update_session_status(id, SessionStatus::Terminated)
                .await?;
            self.log_event(id, "terminate", None).await;
            info!("Session {id} terminated");
            return Ok(true);
        }

        // Not live: a restored multiplexer-backed session can still be
        // terminated; unknown or already-terminated ids report false.
        match self.inner.store.get_session(id).await? {
            Some(record) if record.status != SessionStatus::Terminated.as_str() => {
                if let Some(handle) = &record.external_mux_handle {
                    persist::kill_mux_session(handle).await;
                }
                self.inner
                    .store
                    .update_session_status(id, SessionStatus::Terminated)
                    .await?;
                self.log_event(id, "terminate", None).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Terminate if live, then delete the durable record. Scrollback and
    /// event-log rows cascade away with it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.inner.store.get_session(id).await?.is_none() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        self.terminate(id).await?;
        self.inner.store.delete_session(id).await?;
        info!("Session {id} deleted");
        Ok(())
    }

    /// Subscribe to raw PTY output. The callback runs on the PTY reader
    /// task and must not block. Returns `None` for non-live sessions.
    pub async fn subscribe_data(&self, id: &str, f: DataFn) -> Option<Subscription> {
        let sessions = self.inner.sessions.read().await;
        let live = sessions.get(id)?;
        let sub_id = live.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        live.shared
            .state
            .lock()
            .expect("session state lock poisoned")
            .data_subs
            .insert(sub_id, f);
        Some(Subscription {
            shared: Arc::downgrade(&live.shared),
            id: sub_id,
            kind: SubKind::Data,
        })
    }

    /// Subscribe to the shell exit event. Same constraints as
    /// [`subscribe_data`](Self::subscribe_data).
    pub async fn subscribe_exit(&self, id: &str, f: ExitFn) -> Option<Subscription> {
        let sessions = self.inner.sessions.read().await;
        let live = sessions.get(id)?;
        let sub_id = live.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        live.shared
            .state
            .lock()
            .expect("session state lock poisoned")
            .exit_subs
            .insert(sub_id, f);
        Some(Subscription {
            shared: Arc::downgrade(&live.shared),
            id: sub_id,
            kind: SubKind::Exit,
        })
    }

    /// Attach a client with a consistent history snapshot: under the
    /// session lock, snapshot the ring, hand it to `reply` (which must not
    /// block; it queues the attach frame), then register both
    /// subscriptions. Output arriving concurrently waits on the same lock,
    /// so every later `terminal.data` frame strictly follows the snapshot
    /// with no loss and no duplication.
    pub async fn attach_with_history(
        &self,
        id: &str,
        client: ClientId,
        reply: impl FnOnce(String),
        data_fn: DataFn,
        exit_fn: ExitFn,
    ) -> Result<(Subscription, Subscription)> {
        let (first, data_sub, exit_sub) = {
            let sessions = self.inner.sessions.read().await;
            let live = sessions
                .get(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            let data_id = live.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
            let exit_id = live.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
            let mut state = live.shared.state.lock().expect("session state lock poisoned");
            reply(state.ring.joined());
            state.data_subs.insert(data_id, data_fn);
            state.exit_subs.insert(exit_id, exit_fn);
            let was_empty = state.attached.is_empty();
            state.attached.insert(client);
            *live.empty_since.lock().expect("empty_since lock poisoned") = None;
            (
                was_empty,
                Subscription {
                    shared: Arc::downgrade(&live.shared),
                    id: data_id,
                    kind: SubKind::Data,
                },
                Subscription {
                    shared: Arc::downgrade(&live.shared),
                    id: exit_id,
                    kind: SubKind::Exit,
                },
            )
        };
        if first {
            self.inner
                .store
                .update_session_status(id, SessionStatus::Active)
                .await?;
        }
        self.log_event(id, "attach-client", Some(&format!("{{\"client\":{client}}}")))
            .await;
        Ok((data_sub, exit_sub))
    }

    /// Record a client as attached. On the first attach the durable status
    /// flips to active. Attaching twice is a no-op.
    pub async fn attach_client(&self, id: &str, client: ClientId) -> Result<()> {
        let first = {
            let sessions = self.inner.sessions.read().await;
            let live = sessions
                .get(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            let mut state = live.shared.state.lock().expect("session state lock poisoned");
            let was_empty = state.attached.is_empty();
            state.attached.insert(client);
            *live.empty_since.lock().expect("empty_since lock poisoned") = None;
            was_empty
        };
        if first {
            self.inner
                .store
                .update_session_status(id, SessionStatus::Active)
                .await?;
        }
        self.log_event(id, "attach-client", Some(&format!("{{\"client\":{client}}}")))
            .await;
        Ok(())
    }

    /// Remove a client from the attached set. On the last detach the
    /// durable status flips to idle and the reaper clock starts.
    pub async fn detach_client(&self, id: &str, client: ClientId) -> Result<()> {
        let emptied = {
            let sessions = self.inner.sessions.read().await;
            let Some(live) = sessions.get(id) else {
                // Session already gone; detaching is bookkeeping only.
                return Ok(());
            };
            let mut state = live.shared.state.lock().expect("session state lock poisoned");
            let removed = state.attached.remove(&client);
            let emptied = removed && state.attached.is_empty();
            if emptied {
                *live.empty_since.lock().expect("empty_since lock poisoned") =
                    Some(Instant::now());
            }
            emptied
        };
        if emptied {
            self.inner
                .store
                .update_session_status(id, SessionStatus::Idle)
                .await?;
        }
        self.log_event(id, "detach-client", Some(&format!("{{\"client\":{client}}}")))
            .await;
        Ok(())
    }

    /// History for an attach reply: the live ring joined with LF, or the
    /// last persisted blob for terminated/unloaded sessions.
    pub async fn get_scrollback(&self, id: &str) -> Result<String> {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(live) = sessions.get(id) {
                return Ok(live
                    .shared
                    .state
                    .lock()
                    .expect("session state lock poisoned")
                    .ring
                    .joined());
            }
        }
        Ok(self
            .inner
            .store
            .get_scrollback(id)
            .await?
            .unwrap_or_default())
    }

    /// Revive a multiplexer-backed durable session after a server restart:
    /// spawn a fresh PTY that re-attaches to the recorded tmux handle.
    /// Returns true when the session is live afterwards.
    pub async fn revive(&self, id: &str) -> Result<bool> {
        if self.is_live(id).await {
            return Ok(true);
        }
        if self.inner.mode != PersistMode::ExternalMux {
            return Ok(false);
        }
        let Some(record) = self.inner.store.get_session(id).await? else {
            return Ok(false);
        };
        if record.status == SessionStatus::Terminated.as_str()
            || record.external_mux_handle.is_none()
        {
            return Ok(false);
        }

        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(id) {
            return Ok(true);
        }
        let live = self.spawn_live(
            id,
            &record.shell,
            &record.cwd,
            record.cols,
            record.rows,
            HashMap::new(),
            record.external_mux_handle.clone(),
        )?;
        sessions.insert(id.to_string(), live);
        info!("Session {id} revived from tmux handle");
        Ok(true)
    }

    /// Shell exit: notify exit subscribers, persist scrollback, mark the
    /// session terminated. No-op when the session was already removed by an
    /// explicit terminate.
    async fn handle_pty_exit(&self, id: &str, code: i32) {
        let Some(live) = self.inner.sessions.write().await.remove(id) else {
            return;
        };

        let (exit_subs, content) = {
            let mut state = live.shared.state.lock().expect("session state lock poisoned");
            state.data_subs.clear();
            let subs: Vec<ExitFn> = state.exit_subs.drain().map(|(_, f)| f).collect();
            (subs, state.ring.joined())
        };
        for sub in exit_subs {
            sub(code);
        }

        if self.inner.mode == PersistMode::StoredScrollback {
            if let Err(e) = self.inner.store.save_scrollback(id, &content).await {
                warn!("Failed to persist scrollback for exited session {id}: {e}");
            }
        }
        if let Err(e) = self
            .inner
            .store
            .update_session_status(id, SessionStatus::Terminated)
            .await
        {
            warn!("Failed to mark exited session {id} terminated: {e}");
        }
        self.log_event(id, "exit", Some(&format!("{{\"code\":{code}}}")))
            .await;
    }

    /// One reaper tick: flush overdue debounced touches, then terminate
    /// sessions whose attached set has been empty past the idle timeout.
    /// Returns the reaped ids so the caller can broadcast them. Errors are
    /// swallowed; the next tick retries.
    pub async fn reap_idle(&self) -> Vec<String> {
        let (dirty, expired) = {
            let sessions = self.inner.sessions.read().await;
            let mut dirty = Vec::new();
            let mut expired = Vec::new();
            for (id, live) in sessions.iter() {
                {
                    let mut touch = live.touch.lock().expect("touch lock poisoned");
                    if touch.dirty && touch.last_persist.elapsed() >= TOUCH_DEBOUNCE {
                        touch.dirty = false;
                        touch.last_persist = Instant::now();
                        dirty.push(id.clone());
                    }
                }
                if self.inner.idle_timeout.is_zero() {
                    continue;
                }
                let empty_since = *live.empty_since.lock().expect("empty_since lock poisoned");
                if let Some(since) = empty_since {
                    if since.elapsed() >= self.inner.idle_timeout {
                        expired.push(id.clone());
                    }
                }
            }
            (dirty, expired)
        };

        for id in dirty {
            if let Err(e) = self.inner.store.touch_session(&id, now_ms() as i64).await {
                warn!("Deferred touch for {id} failed: {e}");
            }
        }

        let mut reaped = Vec::new();
        for id in expired {
            info!("Session {id} idle past timeout, reaping");
            match self.terminate(&id).await {
                Ok(true) => reaped.push(id),
                Ok(false) => {}
                Err(e) => warn!("Idle reap of {id} failed: {e}"),
            }
        }
        reaped
    }

    /// Graceful shutdown: flush debounced touches, persist scrollback
    /// (fallback mode), mark live sessions idle so multiplexer-backed ones
    /// can be revived after restart, and kill only the PTYs that have no
    /// tmux handle keeping their shell alive.
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.write().await;
        let count = sessions.len();
        for (id, live) in sessions.drain() {
            let needs_touch = live.touch.lock().expect("touch lock poisoned").dirty;
            if needs_touch {
                if let Err(e) = self.inner.store.touch_session(&id, now_ms() as i64).await {
                    warn!("Shutdown touch for {id} failed: {e}");
                }
            }
            if self.inner.mode == PersistMode::StoredScrollback {
                let content = live
                    .shared
                    .state
                    .lock()
                    .expect("session state lock poisoned")
                    .ring
                    .joined();
                if let Err(e) = self.inner.store.save_scrollback(&id, &content).await {
                    warn!("Shutdown scrollback persist for {id} failed: {e}");
                }
            }
            if let Err(e) = self
                .inner
                .store
                .update_session_status(&id, SessionStatus::Idle)
                .await
            {
                warn!("Shutdown status update for {id} failed: {e}");
            }
            if live.mux_handle.is_none() {
                live.pty.kill();
            }
        }
        if count > 0 {
            info!("Shut down {count} live session(s)");
        }
    }

    /// Best-effort event-log append; failures are logged, never surfaced.
    async fn log_event(&self, id: &str, event: &str, details: Option<&str>) {
        if let Err(e) = self.inner.store.append_log(id, event, details).await {
            warn!("Event log append ({event}) for {id} failed: {e}");
        }
    }
}

/// Trim and bound a session name.
pub fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_string();
    if name.is_empty() {
        return Err(Error::InvalidInput("Session name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "Session name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

/// Shell paths are restricted to `[A-Za-z0-9/_.-]+`.
pub fn validate_shell(shell: &str) -> Result<()> {
    let ok = !shell.is_empty()
        && shell
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid shell path: {shell}")))
    }
}

/// Working directories are length-bounded and must not traverse upward.
pub fn validate_cwd(cwd: &str) -> Result<()> {
    if cwd.chars().count() > MAX_CWD_LEN {
        return Err(Error::InvalidInput(format!(
            "Working directory must be at most {MAX_CWD_LEN} characters"
        )));
    }
    if cwd.contains("..") {
        return Err(Error::InvalidInput(
            "Working directory must not contain '..'".into(),
        ));
    }
    Ok(())
}

/// Terminal dimensions must sit in [1, 500].
pub fn validate_dims(cols: u16, rows: u16) -> Result<()> {
    if (1..=MAX_DIM).contains(&cols) && (1..=MAX_DIM).contains(&rows) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Terminal dimensions must be between 1 and {MAX_DIM} (got {cols}x{rows})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_trimmed_and_bounded() {
        assert_eq!(validate_name("  hi  ").unwrap(), "hi");
        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(100)).is_ok());
        assert!(validate_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn shell_charset_is_enforced() {
        assert!(validate_shell("/bin/bash").is_ok());
        assert!(validate_shell("/usr/local/bin/fish-3.7").is_ok());
        assert!(validate_shell("/bin/sh; rm -rf /").is_err());
        assert!(validate_shell("bash $(id)").is_err());
        assert!(validate_shell("").is_err());
    }

    #[test]
    fn cwd_rejects_traversal_and_length() {
        assert!(validate_cwd("/home/user/project").is_ok());
        assert!(validate_cwd("/tmp/../etc").is_err());
        assert!(validate_cwd(&"/a".repeat(250)).is_ok());
        assert!(validate_cwd(&"/a".repeat(251)).is_err());
    }

    #[test]
    fn dims_must_be_in_range() {
        assert!(validate_dims(1, 1).is_ok());
        assert!(validate_dims(500, 500).is_ok());
        assert!(validate_dims(0, 24).is_err());
        assert!(validate_dims(80, 501).is_err());
    }

    async fn test_manager() -> SessionManager {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut config = Config::default();
        config.sessions.max_sessions = 2;
        config.sessions.default_shell = "/bin/sh".to_string();
        config.sessions.default_working_dir = "/tmp".to_string();
        SessionManager::new(store, PersistMode::StoredScrollback, &config)
    }

    fn opts() -> CreateOpts {
        CreateOpts {
            shell: Some("/bin/sh".to_string()),
            cwd: Some("/tmp".to_string()),
            ..CreateOpts::default()
        }
    }

    #[tokio::test]
    async fn create_then_list_is_attachable() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        assert_eq!(record.status, "active");
        assert_eq!(record.sort_order, 0);

        let list = mgr.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].attachable);
        assert_eq!(list[0].record.id, record.id);

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let mgr = test_manager().await;
        mgr.create(opts()).await.unwrap();
        mgr.create(opts()).await.unwrap();
        let err = mgr.create(opts()).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(2)));
        assert_eq!(err.to_string(), "Maximum session limit (2) reached");
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn terminate_frees_quota_and_reports_unknown() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        assert!(mgr.terminate(&record.id).await.unwrap());
        // Second terminate and unknown ids report false.
        assert!(!mgr.terminate(&record.id).await.unwrap());
        assert!(!mgr.terminate("missing").await.unwrap());

        // Quota slot is free again.
        mgr.create(opts()).await.unwrap();
        mgr.create(opts()).await.unwrap();
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn delete_removes_all_traces() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        let id = record.id.clone();
        mgr.delete(&id).await.unwrap();

        assert!(mgr.get(&id).await.unwrap().is_none());
        assert!(mgr.store().get_scrollback(&id).await.unwrap().is_none());
        assert!(mgr.store().logs_for_session(&id).await.unwrap().is_empty());
        assert!(matches!(
            mgr.delete(&id).await.unwrap_err(),
            Error::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn attach_detach_flips_durable_status() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        let id = record.id.clone();

        mgr.attach_client(&id, 1).await.unwrap();
        // Idempotent second attach.
        mgr.attach_client(&id, 1).await.unwrap();
        mgr.attach_client(&id, 2).await.unwrap();
        assert_eq!(mgr.get(&id).await.unwrap().unwrap().record.status, "active");

        mgr.detach_client(&id, 1).await.unwrap();
        assert_eq!(mgr.get(&id).await.unwrap().unwrap().record.status, "active");
        mgr.detach_client(&id, 2).await.unwrap();
        assert_eq!(mgr.get(&id).await.unwrap().unwrap().record.status, "idle");
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn echo_reaches_ring_and_subscribers() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        let id = record.id.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let sub = mgr
            .subscribe_data(
                &id,
                Arc::new(move |bytes| {
                    let _ = tx.send(bytes.to_vec());
                }),
            )
            .await
            .unwrap();

        mgr.write(&id, b"echo marker42\r").await.unwrap();

        // Wait for the marker to flow through the PTY round-trip.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
                Ok(Some(chunk)) => {
                    seen.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&seen).contains("marker42") {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(
            String::from_utf8_lossy(&seen).contains("marker42"),
            "subscriber never saw the echo output"
        );

        let scrollback = mgr.get_scrollback(&id).await.unwrap();
        assert!(scrollback.contains("marker42"));

        sub.cancel();
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn terminated_session_serves_stored_scrollback() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        let id = record.id.clone();

        mgr.write(&id, b"echo persisted-line\r").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if mgr.get_scrollback(&id).await.unwrap().contains("persisted-line") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(mgr.terminate(&id).await.unwrap());
        let stored = mgr.get_scrollback(&id).await.unwrap();
        assert!(stored.contains("persisted-line"));
    }

    #[tokio::test]
    async fn move_to_unknown_category_is_rejected() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        let err = mgr
            .move_to_category(&record.id, Some("does-not-exist"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CategoryNotFound));
        let after = mgr.get(&record.id).await.unwrap().unwrap();
        assert!(after.record.category_id.is_none());
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn rename_is_idempotent_and_validated() {
        let mgr = test_manager().await;
        let record = mgr.create(opts()).await.unwrap();
        mgr.rename(&record.id, "workbench").await.unwrap();
        mgr.rename(&record.id, "workbench").await.unwrap();
        let after = mgr.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.record.name, "workbench");

        assert!(mgr.rename(&record.id, &"x".repeat(101)).await.is_err());
        assert!(matches!(
            mgr.rename("missing", "n").await.unwrap_err(),
            Error::SessionNotFound(_)
        ));
        mgr.shutdown().await;
    }
}
