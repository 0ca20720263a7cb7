//! Scrollback persistence strategy selection.
//!
//! When a `tmux` binary exists on the host, each session's PTY child is
//! `tmux new-session -A -s <handle> <shell>`: tmux keeps the shell alive
//! across server restarts and the handle name is recorded on the session
//! row, so a later attach revives it with the same command. Without tmux,
//! the manager persists the ring contents to the `scrollback` table on
//! terminate/exit/shutdown and seeds attach replies from the stored blob.
//!
//! The strategy is probed once at startup and fixed for the manager's
//! lifetime; no per-call branching elsewhere.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

/// How session history survives the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// An external multiplexer (tmux) keeps the shell itself alive.
    ExternalMux,
    /// The ring contents are written to the metadata store.
    StoredScrollback,
}

/// Probe `$PATH` for a tmux binary and pick the persistence mode.
pub fn detect_mode() -> PersistMode {
    let found = std::env::var_os("PATH").is_some_and(|path| {
        std::env::split_paths(&path).any(|dir| Path::new(&dir.join("tmux")).is_file())
    });
    if found {
        info!("tmux found, sessions will use the external multiplexer");
        PersistMode::ExternalMux
    } else {
        info!("tmux not found, falling back to stored scrollback");
        PersistMode::StoredScrollback
    }
}

/// Multiplexer handle name for a session id.
pub fn mux_handle_name(session_id: &str) -> String {
    format!("ttyhub-{}", &session_id[..8.min(session_id.len())])
}

/// Tear down a tmux session. Errors are logged and swallowed; the handle
/// may already be gone if the user killed it by hand.
pub async fn kill_mux_session(handle: &str) {
    match Command::new("tmux")
        .args(["kill-session", "-t", handle])
        .status()
        .await
    {
        Ok(s) if !s.success() => warn!("tmux kill-session -t {handle} exited with {s}"),
        Err(e) => warn!("Failed to run tmux kill-session: {e}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_name_uses_short_id() {
        assert_eq!(
            mux_handle_name("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9"),
            "ttyhub-0a1b2c3d"
        );
        assert_eq!(mux_handle_name("abc"), "ttyhub-abc");
    }
}
