//! Protocol error types.
//!
//! Every decoding failure is a structured error, never a panic: the decoder
//! must survive arbitrary bytes from a crashing or misbehaving sidecar.
//! Frame-level errors are recoverable by resynchronization; envelope-level
//! errors consume exactly one frame and leave the stream aligned.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames and envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is too short to contain a frame header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Header claims more payload bytes than the buffer holds.
    #[error("frame truncated: header claims {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload bytes the header claims.
        expected: usize,
        /// Payload bytes actually available.
        actual: usize,
    },

    /// Magic marker does not match the protocol constant.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Protocol version is not supported by this client.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the size limit.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Claimed or actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Envelope JSON failed to serialize or deserialize.
    ///
    /// Stored as a string so the error stays `Clone + PartialEq`
    /// (`serde_json::Error` is neither).
    #[error("invalid envelope: {0}")]
    Envelope(String),
}

impl ProtocolError {
    /// Returns true if the decoder can recover by resynchronizing on the
    /// next magic marker.
    ///
    /// Envelope errors are already frame-aligned and need no resync;
    /// truncation means the decoder should simply wait for more bytes.
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic | Self::UnsupportedVersion(_) | Self::PayloadTooLarge { .. }
        )
    }
}
