//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TTYHUB_PORT`, `TTYHUB_HOST`,
//!    `TTYHUB_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `ttyhub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! port = 4220
//! host = "0.0.0.0"
//!
//! [sessions]
//! max_sessions = 10
//! idle_timeout_minutes = 0   # 0 = never reap
//! default_shell = "/bin/bash"
//!
//! [persistence]
//! scrollback_lines = 10000
//!
//! [auth]
//! enabled = false
//! allowed_users = []
//!
//! [storage]
//! data_dir = "~/.local/share/ttyhub"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port to bind (default 4220).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address (default `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: String,
}

/// Session pool limits and defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Maximum non-terminated sessions (default 10).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Minutes a session may sit with no attached clients before the reaper
    /// terminates it. 0 disables reaping (default).
    #[serde(default)]
    pub idle_timeout_minutes: u64,
    /// Shell spawned when a create request names none (default `/bin/bash`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory used when a create request names none (default `~`).
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
}

/// Scrollback retention settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Completed lines kept per session ring (default 10 000).
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
}

/// Identity gate settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// When false (default) every peer resolves to the anonymous principal.
    #[serde(default)]
    pub enabled: bool,
    /// Login names accepted when `enabled = true`.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Durable state location.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the metadata database and log directory.
    /// Default: `$XDG_DATA_HOME/ttyhub` (or the platform equivalent).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_port() -> u16 {
    4220
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_max_sessions() -> usize {
    10
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_scrollback_lines() -> usize {
    10_000
}
fn default_data_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ttyhub")
        .to_string_lossy()
        .into_owned()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_minutes: 0,
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: default_scrollback_lines(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sessions: SessionsConfig::default(),
            persistence: PersistenceConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure, the server
    /// cannot run misconfigured). Otherwise looks for `ttyhub.toml` in the
    /// current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("ttyhub.toml").exists() {
            let content =
                std::fs::read_to_string("ttyhub.toml").expect("Failed to read ttyhub.toml");
            toml::from_str(&content).expect("Failed to parse ttyhub.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(port) = std::env::var("TTYHUB_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(host) = std::env::var("TTYHUB_HOST") {
            config.server.host = host;
        }
        if let Ok(dir) = std::env::var("TTYHUB_DATA_DIR") {
            config.storage.data_dir = dir;
        }

        config
    }

    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Path of the metadata database file under the data directory.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(crate::util::expand_tilde(&self.storage.data_dir).as_ref()).join("ttyhub.db")
    }

    /// Log directory under the data directory.
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(crate::util::expand_tilde(&self.storage.data_dir).as_ref()).join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.server.port, 4220);
        assert_eq!(c.server.host, "0.0.0.0");
        assert_eq!(c.sessions.max_sessions, 10);
        assert_eq!(c.sessions.idle_timeout_minutes, 0);
        assert_eq!(c.persistence.scrollback_lines, 10_000);
        assert!(!c.auth.enabled);
        assert!(c.auth.allowed_users.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [auth]
            enabled = true
            allowed_users = ["alice", "bob"]
            "#,
        )
        .unwrap();
        assert_eq!(c.server.port, 9000);
        assert_eq!(c.server.host, "0.0.0.0");
        assert!(c.auth.enabled);
        assert_eq!(c.auth.allowed_users, vec!["alice", "bob"]);
        assert_eq!(c.sessions.max_sessions, 10);
    }

    #[test]
    fn listen_addr_joins_host_and_port() {
        let c = Config::default();
        assert_eq!(c.listen_addr(), "0.0.0.0:4220");
    }
}
