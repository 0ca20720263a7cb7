//! In-process pub/sub for per-session event pings.
//!
//! Hook scripts post `needs-input` / `completed` events through the HTTP
//! ingress; the bus broadcasts them to every open connection (which applies
//! the recipient's preference gating) and remembers the latest event per
//! session so badges can be restored on reattach. The remembered entry is
//! cleared as soon as any client attaches to the session.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::util::now_ms;

/// What the hook observed in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyKind {
    NeedsInput,
    Completed,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsInput => "needs-input",
            Self::Completed => "completed",
        }
    }

    /// Parse the path segment of the hook endpoint.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "needs-input" => Some(Self::NeedsInput),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// One published event. Serializes in the wire's camelCase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub session_id: String,
    pub kind: NotifyKind,
    pub timestamp_ms: u64,
}

/// Process-wide notification fan-out with a latest-per-session map.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
    latest: Mutex<HashMap<String, Notification>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Record and broadcast an event. Lagging or absent receivers are fine;
    /// the latest map is the durable-enough view.
    pub fn publish(&self, session_id: &str, kind: NotifyKind) {
        let notification = Notification {
            session_id: session_id.to_string(),
            kind,
            timestamp_ms: now_ms(),
        };
        self.latest
            .lock()
            .expect("notification map lock poisoned")
            .insert(session_id.to_string(), notification.clone());
        let _ = self.tx.send(notification);
    }

    /// Subscribe for live events; called once per connection at startup.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Forget the pending event for a session (a client just attached).
    pub fn clear(&self, session_id: &str) {
        self.latest
            .lock()
            .expect("notification map lock poisoned")
            .remove(session_id);
    }

    /// Pending events for badge restoration on reconnect.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.latest
            .lock()
            .expect("notification map lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
