//! Principal resolution for incoming connections.
//!
//! The WebSocket upgrade and the notify hook both pass through an
//! [`IdentityProvider`]. Which implementation is active is decided once at
//! startup from `auth.enabled`; nothing else in the codebase branches on
//! the flag.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Resolved identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable identifier used as the preference/ownership key.
    pub user_id: String,
    /// Login name as supplied by the front-door.
    pub login_name: String,
    /// Human-readable name for UI display.
    pub display_name: String,
}

impl Principal {
    /// The placeholder principal used when authentication is disabled.
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            login_name: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
        }
    }
}

/// Maps a peer address (plus the front-door's login hint) to a principal.
pub trait IdentityProvider: Send + Sync {
    /// Resolve the peer to a principal or reject the connection.
    fn resolve(&self, peer: SocketAddr, login_hint: Option<&str>) -> Result<Principal>;

    /// Short status string surfaced by `GET /health`.
    fn status(&self) -> &'static str;
}

/// Provider used when `auth.enabled = false`: every peer is anonymous.
pub struct AnonymousProvider;

impl IdentityProvider for AnonymousProvider {
    fn resolve(&self, _peer: SocketAddr, _login_hint: Option<&str>) -> Result<Principal> {
        Ok(Principal::anonymous())
    }

    fn status(&self) -> &'static str {
        "anonymous"
    }
}

/// Provider used when `auth.enabled = true`: the front-door supplies a login
/// name (`?user=` on the upgrade request) which must appear in
/// `auth.allowed_users`.
pub struct AllowlistProvider {
    allowed: Vec<String>,
}

impl AllowlistProvider {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

impl IdentityProvider for AllowlistProvider {
    fn resolve(&self, _peer: SocketAddr, login_hint: Option<&str>) -> Result<Principal> {
        let login = login_hint.ok_or(Error::Unauthorized)?;
        if !self.allowed.iter().any(|u| u == login) {
            return Err(Error::Unauthorized);
        }
        Ok(Principal {
            user_id: login.to_string(),
            login_name: login.to_string(),
            display_name: login.to_string(),
        })
    }

    fn status(&self) -> &'static str {
        "allowlist"
    }
}

/// Construct the provider matching the auth configuration.
pub fn provider_from_config(auth: &AuthConfig) -> Arc<dyn IdentityProvider> {
    if auth.enabled {
        Arc::new(AllowlistProvider::new(auth.allowed_users.clone()))
    } else {
        Arc::new(AnonymousProvider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn anonymous_resolves_everyone() {
        let p = AnonymousProvider;
        let got = p.resolve(peer(), None).unwrap();
        assert_eq!(got, Principal::anonymous());
        assert_eq!(p.status(), "anonymous");
    }

    #[test]
    fn allowlist_accepts_listed_user() {
        let p = AllowlistProvider::new(vec!["alice".into()]);
        let got = p.resolve(peer(), Some("alice")).unwrap();
        assert_eq!(got.user_id, "alice");
    }

    #[test]
    fn allowlist_rejects_unlisted_and_missing() {
        let p = AllowlistProvider::new(vec!["alice".into()]);
        assert!(p.resolve(peer(), Some("mallory")).is_err());
        assert!(p.resolve(peer(), None).is_err());
    }
}
