//! Channel-level messages: readiness and broadcast errors.

use serde::{Deserialize, Serialize};

/// Messages the sidecar emits on the `system` module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SystemMessage {
    /// The sidecar has finished starting and is accepting commands.
    ///
    /// Emitted promptly after spawn; the supervisor's readiness wait keys
    /// off this message.
    Ready,

    /// Channel-level failure not tied to any one request.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}
