//! JSON message envelope carried by every frame.
//!
//! The envelope is the multiplexing layer: `module` selects which client a
//! frame is delivered to, `type` + `payload` form the module-specific
//! message, and `request_id` correlates a reply or stream with the command
//! that started it. A missing `request_id` marks a module-wide broadcast
//! (e.g. a module-level `error`).
//!
//! Module clients never match on the `type` string directly. The
//! [`message_from_envelope`] / [`envelope_from_message`] helpers bridge the
//! `type`/`payload` pair to adjacently-tagged serde enums
//! (`#[serde(tag = "type", content = "payload")]`), so every known message
//! is matched exhaustively at compile time and unknown types fall out as a
//! single decode error the caller drops.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

/// Well-known module names multiplexed over the sidecar channel.
pub mod modules {
    /// Channel-level module: readiness signal and broadcast errors.
    pub const SYSTEM: &str = "system";

    /// Streaming LLM inference.
    pub const LLM: &str = "llm";

    /// Pseudoterminal sessions.
    pub const TERMINAL: &str = "terminal";
}

/// One multiplexed message on the sidecar channel.
///
/// Wire form:
/// `{ "module": "...", "type": "...", "request_id": "...", "payload": {...} }`
///
/// `module` + `type` together select a handler. The `module` field stays a
/// plain string so frames for modules this client does not know are still
/// representable (they are dropped with a warning at the router).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target module name.
    pub module: String,

    /// Module-specific message type.
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation token tying a reply or stream to its originating
    /// command. Absent for module-wide broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Message body. `Null` for messages that carry no data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Parse the envelope body from raw frame payload bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Envelope(e.to_string()))
    }

    /// Serialize the envelope body to frame payload bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Envelope(e.to_string()))
    }
}

/// Decode an envelope's `type`/`payload` pair into a typed message enum.
///
/// `T` must be an adjacently-tagged enum (`tag = "type"`,
/// `content = "payload"`). An unknown `type` or malformed payload comes back
/// as [`ProtocolError::Envelope`]; the caller decides whether that is a
/// protocol error or a forward-compatible drop.
pub fn message_from_envelope<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    let tagged = serde_json::json!({
        "type": envelope.kind,
        "payload": envelope.payload,
    });
    serde_json::from_value(tagged).map_err(|e| ProtocolError::Envelope(e.to_string()))
}

/// Build an envelope from a typed message enum.
///
/// The inverse of [`message_from_envelope`]: serializes `T` through its
/// adjacent tagging and lifts the `type`/`payload` pair into envelope
/// fields.
pub fn envelope_from_message<T: Serialize>(
    module: &str,
    request_id: Option<String>,
    message: &T,
) -> Result<Envelope> {
    let value = serde_json::to_value(message).map_err(|e| ProtocolError::Envelope(e.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(ProtocolError::Envelope("message did not serialize to a tagged object".into()));
    };

    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::Envelope("message missing string `type` tag".into())),
    };

    let payload = map.remove("payload").unwrap_or(Value::Null);

    Ok(Envelope { module: module.to_owned(), kind, request_id, payload })
}
