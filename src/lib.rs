#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ttyhub library — exposes the core modules for the server binary and for
//! integration tests.
//!
//! - `sessions` — PTY session lifecycle, scrollback, fan-out, persistence
//! - `store` — SQLite metadata store (sessions, categories, prefs, logs)
//! - `ws` — WebSocket protocol handling
//! - `protocol` — wire frame envelope
//! - `identity` — principal resolution (anonymous / allowlist)
//! - `notify` — hook-fed notification bus
//! - `categories` — category and preference CRUD
//! - `ratelimit` — per-client token buckets
//! - `routes` — REST route handlers
//! - `config` — configuration loading

pub mod categories;
pub mod config;
pub mod error;
pub mod identity;
pub mod notify;
pub mod protocol;
pub mod ratelimit;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod store;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use categories::CategoryService;
pub use config::Config;
pub use error::{Error, Result};
pub use notify::NotificationBus;
pub use ratelimit::RateLimiter;
pub use sessions::SessionManager;
pub use state::AppState;
pub use store::MetadataStore;
