//! LLM streaming module vocabulary.
//!
//! The client never sees a provider's wire format: it hands the sidecar an
//! endpoint, headers, an opaque request body, and an `api_format`
//! discriminator, and receives back a flat stream of chunk/thinking events
//! terminated by exactly one completion, error, or nothing at all if the
//! stream was cancelled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters for starting an inference stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStart {
    /// Provider endpoint URL.
    pub endpoint: String,

    /// HTTP headers (auth tokens included) the sidecar sends verbatim.
    pub headers: HashMap<String, String>,

    /// Opaque request body; the sidecar forwards it unchanged.
    pub body: Value,

    /// Which provider wire format the sidecar should speak
    /// (e.g. `"chat-completions"`, `"anthropic-messages"`).
    pub api_format: String,
}

/// Commands the client sends on the `llm` module.
///
/// Every command carries the stream's `request_id` in the envelope; the
/// sidecar echoes it back unchanged on every event of that stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LlmCommand {
    /// Begin a new inference stream.
    StreamStart(StreamStart),

    /// Abort the stream named by the envelope's `request_id`.
    ///
    /// Best-effort: the sidecar tears the stream down asynchronously and
    /// sends no acknowledgment.
    StreamCancel,
}

/// Events the sidecar emits on the `llm` module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LlmServerMessage {
    /// Partial response text.
    StreamChunk {
        /// Text fragment in arrival order.
        content: String,
    },

    /// Partial reasoning text (models that expose thinking).
    StreamThinking {
        /// Thinking fragment in arrival order.
        content: String,
    },

    /// Stream finished successfully.
    StreamComplete {
        /// The full accumulated response text.
        full_content: String,
    },

    /// Stream failed. Terminal: no further events follow for this request.
    StreamError {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// Module-wide failure not tied to one stream (no `request_id`).
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}
