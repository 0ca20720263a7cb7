//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::categories::CategoryService;
use crate::config::Config;
use crate::identity::IdentityProvider;
use crate::notify::NotificationBus;
use crate::protocol::Envelope;
use crate::ratelimit::{ClientId, RateLimiter};
use crate::sessions::SessionManager;

/// A frame fanned out to every open connection, optionally skipping the
/// client whose request produced it (echo prevention for create/rename/
/// delete).
#[derive(Clone)]
pub struct BroadcastEvent {
    pub frame: Envelope,
    pub exclude: Option<ClientId>,
}

/// Shared application state for the ttyhub server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Single authority over live PTY sessions.
    pub session_manager: SessionManager,
    /// Category and notification-preference CRUD.
    pub categories: CategoryService,
    /// Resolves peers to principals (anonymous or allowlist).
    pub identity: Arc<dyn IdentityProvider>,
    /// Per-client token buckets.
    pub rate_limiter: Arc<RateLimiter>,
    /// Hook-fed notification fan-out with badge memory.
    pub notifications: Arc<NotificationBus>,
    /// Broadcast channel for frames every open connection should see.
    pub events: broadcast::Sender<BroadcastEvent>,
    /// Source of server-assigned client ids.
    next_client_id: Arc<AtomicU64>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        session_manager: SessionManager,
        categories: CategoryService,
        identity: Arc<dyn IdentityProvider>,
        rate_limiter: Arc<RateLimiter>,
        notifications: Arc<NotificationBus>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            start_time: Instant::now(),
            session_manager,
            categories,
            identity,
            rate_limiter,
            notifications,
            events,
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Hand out the next client id.
    pub fn assign_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fan a frame out to every open connection (minus `exclude`).
    pub fn broadcast(&self, frame: Envelope, exclude: Option<ClientId>) {
        let _ = self.events.send(BroadcastEvent { frame, exclude });
    }
}
