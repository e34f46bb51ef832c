//! Terminal (PTY) module vocabulary.
//!
//! Terminal sessions are modules-within-a-module: every command and event
//! carries the terminal's session id in the envelope's `request_id`, so
//! multiple terminals multiplex over the same module without blocking one
//! another.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Options for creating a PTY session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTerminal {
    /// Shell to launch. `None` lets the sidecar pick the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Extra arguments passed to the shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_args: Option<Vec<String>>,

    /// Working directory for the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Extra environment variables for the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Initial width in columns.
    pub cols: u16,

    /// Initial height in rows.
    pub rows: u16,
}

impl Default for CreateTerminal {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: None,
            cwd: None,
            env: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Commands the client sends on the `terminal` module.
///
/// The target session id rides in the envelope's `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TerminalCommand {
    /// Create a new PTY session.
    Create(CreateTerminal),

    /// Write input bytes (UTF-8 text, key escape sequences included).
    Write {
        /// Data to feed the PTY.
        data: String,
    },

    /// Resize the PTY.
    Resize {
        /// New width in columns.
        cols: u16,
        /// New height in rows.
        rows: u16,
    },

    /// Terminate the PTY session and release sidecar-side resources.
    Destroy,
}

/// Events the sidecar emits on the `terminal` module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TerminalServerMessage {
    /// PTY output.
    Data {
        /// Raw output text in arrival order.
        data: String,
    },

    /// The shell process exited. Terminal: the session is finished.
    Exit {
        /// Process exit code, when the platform reports one.
        code: Option<i32>,
    },

    /// The running program changed the terminal title.
    TitleChanged {
        /// New title text.
        title: String,
    },

    /// Session-level failure (bad command, PTY allocation failure).
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{envelope_from_message, message_from_envelope, modules};

    #[test]
    fn create_defaults_to_80x24() {
        let options = CreateTerminal::default();
        assert_eq!(options.cols, 80);
        assert_eq!(options.rows, 24);
    }

    #[test]
    fn create_round_trip() {
        let command = TerminalCommand::Create(CreateTerminal {
            shell: Some("zsh".to_owned()),
            cwd: Some("/tmp".to_owned()),
            ..CreateTerminal::default()
        });

        let envelope =
            envelope_from_message(modules::TERMINAL, Some("term-1".to_owned()), &command).unwrap();
        assert_eq!(envelope.kind, "create");

        let back: TerminalCommand = message_from_envelope(&envelope).unwrap();
        assert_eq!(command, back);
    }

    #[test]
    fn exit_event_parses_from_wire_shape() {
        let wire =
            br#"{"module":"terminal","type":"exit","request_id":"term-1","payload":{"code":0}}"#;
        let envelope = crate::Envelope::from_json(wire).unwrap();

        let message: TerminalServerMessage = message_from_envelope(&envelope).unwrap();
        assert_eq!(message, TerminalServerMessage::Exit { code: Some(0) });
    }
}
