//! Wire frame envelope for the WebSocket protocol.
//!
//! Every frame is a JSON object with a required string `type`, an optional
//! correlation `id`, and an optional `payload` object. The codec validates
//! shape only; per-operation payload validation happens in the connection
//! handler. Replies to a client request echo the request's `id`; unsolicited
//! server events carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// A parsed or outgoing protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, e.g. `session.create` or `terminal.data`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation token echoed on replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Operation-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Parse an incoming text frame. Rejects anything that is not a JSON
    /// object with a string `type`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("invalid JSON frame: {e}")))?;
        if !value.is_object() {
            return Err(Error::InvalidInput("frame must be a JSON object".into()));
        }
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(Error::InvalidInput(
                "frame requires a string \"type\" field".into(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidInput(format!("malformed frame: {e}")))
    }

    /// Reply to a request: same `id`, new type and payload.
    pub fn reply(kind: &str, id: Option<&str>, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(ToString::to_string),
            payload: Some(payload),
        }
    }

    /// Unsolicited server event: no correlation id.
    pub fn event(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            payload: Some(payload),
        }
    }

    /// Error frame (`error` or `session.error`) carrying the taxonomy code,
    /// the human-readable message, and the correlation id of the failed
    /// request.
    pub fn error(kind: &str, id: Option<&str>, err: &Error) -> Self {
        Self::reply(
            kind,
            id,
            serde_json::json!({
                "code": err.code(),
                "message": err.to_string(),
            }),
        )
    }

    /// Serialize for the transport.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_frame() {
        let env = Envelope::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind, "ping");
        assert!(env.id.is_none());
        assert!(env.payload.is_none());
    }

    #[test]
    fn parses_full_frame() {
        let env =
            Envelope::parse(r#"{"type":"session.create","id":"1","payload":{"name":"T"}}"#)
                .unwrap();
        assert_eq!(env.kind, "session.create");
        assert_eq!(env.id.as_deref(), Some("1"));
        assert_eq!(env.payload.unwrap()["name"], "T");
    }

    #[test]
    fn rejects_missing_or_nonstring_type() {
        assert!(Envelope::parse(r#"{"id":"1"}"#).is_err());
        assert!(Envelope::parse(r#"{"type":42}"#).is_err());
        assert!(Envelope::parse(r#"[1,2,3]"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn reply_echoes_correlation_id() {
        let frame = Envelope::reply("pong", Some("abc"), serde_json::json!({}));
        assert_eq!(frame.id.as_deref(), Some("abc"));
        let text = frame.to_text();
        let back = Envelope::parse(&text).unwrap();
        assert_eq!(back.kind, "pong");
        assert_eq!(back.id.as_deref(), Some("abc"));
    }

    #[test]
    fn event_carries_no_id() {
        let frame = Envelope::event("terminal.data", serde_json::json!({"data":"x"}));
        assert!(frame.id.is_none());
        assert!(!frame.to_text().contains("\"id\""));
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let err = Error::QuotaExceeded(1);
        let frame = Envelope::error("session.error", Some("9"), &err);
        let payload = frame.payload.unwrap();
        assert_eq!(payload["code"], "QUOTA_EXCEEDED");
        assert_eq!(payload["message"], "Maximum session limit (1) reached");
        assert_eq!(frame.id.as_deref(), Some("9"));
    }
}
