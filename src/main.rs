#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ttyhub
//!
//! Multi-client web terminal service. Browsers connect over a WebSocket at
//! `/ws` and attach to PTY-backed shell sessions that survive disconnects;
//! session metadata, categories, and notification preferences persist in a
//! SQLite database under the per-user data directory.
//!
//! ## HTTP surface
//!
//! | Method | Path                             | Description                      |
//! |--------|----------------------------------|----------------------------------|
//! | GET    | `/ws`                            | WebSocket for terminal sessions  |
//! | GET    | `/health`                        | Liveness + session count         |
//! | GET    | `/api/sessions`                  | Durable list with `attachable`   |
//! | POST   | `/api/notify/{id}/{kind}`        | Hook notification ingress        |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! identity.rs      — principal resolution (anonymous / allowlist)
//! protocol.rs      — wire frame envelope
//! ratelimit.rs     — per-client token buckets
//! notify.rs        — notification bus with badge memory
//! categories.rs    — category/preference CRUD
//! shell/
//!   pty.rs         — PTY allocation, spawn, resize, I/O callbacks
//! sessions/
//!   scrollback.rs  — bounded line ring with partial-line carry
//!   persist.rs     — tmux probe + stored-scrollback fallback
//!   mod.rs         — SessionManager (lifecycle, fan-out, quota, reaper)
//! store/           — SQLite metadata store + migrations
//! ws/              — WebSocket upgrade, per-client state machine, dispatch
//! routes/          — REST handlers (health, sessions, notify)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ttyhub::protocol::Envelope;
use ttyhub::sessions::persist;
use ttyhub::{
    AppState, CategoryService, Config, MetadataStore, NotificationBus, RateLimiter, SessionManager,
};

/// Multi-client web terminal service.
#[derive(Parser)]
#[command(name = "ttyhub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // A panic in any top-level task is fatal: log it, give tracing a moment
    // to flush, exit non-zero.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        tracing::error!("Fatal: {info}");
        std::thread::sleep(std::time::Duration::from_millis(200));
        std::process::exit(1);
    }));

    info!("ttyhub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.listen_addr());

    if let Err(e) = std::fs::create_dir_all(config.log_dir()) {
        warn!("Failed to create log directory: {e}");
    }

    let store = match MetadataStore::open(&config.db_path()).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open metadata store: {e}");
            std::process::exit(1);
        }
    };

    let mode = persist::detect_mode();
    let config = Arc::new(config);
    let session_manager = SessionManager::new(store.clone(), mode, &config);
    let categories = CategoryService::new(store.clone());
    let identity = ttyhub::identity::provider_from_config(&config.auth);
    let state = AppState::new(
        Arc::clone(&config),
        session_manager,
        categories,
        identity,
        Arc::new(RateLimiter::new()),
        Arc::new(NotificationBus::new()),
    );

    let app = Router::new()
        .route("/ws", get(ttyhub::ws::ws_upgrade))
        .route("/health", get(ttyhub::routes::health::health))
        .route("/api/sessions", get(ttyhub::routes::sessions::list_sessions))
        .route(
            "/api/notify/{session_id}/{kind}",
            post(ttyhub::routes::notify::notify),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.listen_addr())
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Idle reaper: one periodic task for all sessions. Terminated ids are
    // broadcast so attached clients can drop their views.
    let reaper_state = state.clone();
    let reaper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            for session_id in reaper_state.session_manager.reap_idle().await {
                reaper_state.broadcast(
                    Envelope::event("session.terminated", json!({ "sessionId": session_id })),
                    None,
                );
            }
        }
    });

    // Graceful shutdown on SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    info!("Shutting down...");
    reaper_task.abort();
    state.session_manager.shutdown().await;
    store.close().await;
    info!("Goodbye");
}
