//! Error types for the client runtime.
//!
//! Strongly-typed errors per layer, with recovery semantics documented on
//! each variant: spawn failures are fatal, readiness timeouts are retried by
//! supervisor policy, send failures surface immediately to the caller and
//! are never queued silently.

use std::{path::PathBuf, time::Duration};

use tether_proto::ProtocolError;
use thiserror::Error;

/// Failures locating or launching the sidecar binary.
///
/// All variants are fatal: the supervisor does not retry a spawn failure,
/// it surfaces the error to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Binary not found at the resolved path.
    #[error("sidecar binary missing: {path}")]
    Missing {
        /// Path that was checked.
        path: PathBuf,
    },

    /// Binary exists but lacks the executable bit.
    #[error("sidecar binary not executable: {path}")]
    NotExecutable {
        /// Path that was checked.
        path: PathBuf,
    },

    /// Detached `.sha256` checksum file is absent.
    #[error("checksum file missing for {path}")]
    ChecksumMissing {
        /// Binary the checksum should accompany.
        path: PathBuf,
    },

    /// Checksum file exists but is not `"{hex-digest}  {filename}"`.
    #[error("malformed checksum file for {path}")]
    ChecksumFormat {
        /// Binary the checksum accompanies.
        path: PathBuf,
    },

    /// Binary contents do not hash to the published digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Binary that failed verification.
        path: PathBuf,
        /// Digest from the checksum file.
        expected: String,
        /// Digest computed from the binary.
        actual: String,
    },

    /// Filesystem or process-launch I/O failure.
    ///
    /// The message is captured as a string so the error stays
    /// `Clone + PartialEq` (`std::io::Error` is neither).
    #[error("i/o error for {path}: {message}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error text.
        message: String,
    },
}

/// Failures of the supervisor's lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// The sidecar binary could not be launched.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The sidecar did not emit its readiness frame in time.
    ///
    /// Retried by supervisor restart policy before becoming terminal.
    #[error("sidecar not ready after {elapsed:?}")]
    ReadyTimeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// Restart budget exhausted; the sidecar stays down until reset.
    ///
    /// Terminal: surfaced once, not repeated per attempted operation.
    #[error("sidecar unavailable after {crashes} consecutive crashes")]
    Unavailable {
        /// Consecutive crashes before giving up, including the final one
        /// that was not retried.
        crashes: u32,
    },

    /// The supervisor was shut down while the operation was in flight.
    #[error("supervisor stopped")]
    Stopped,
}

impl SupervisorError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Readiness timeouts are transient (a slow machine may recover);
    /// spawn failures and budget exhaustion are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadyTimeout { .. })
    }
}

/// Failures sending a command to the sidecar.
///
/// Sends fail fast: there is no hidden queueing behind any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Transport is not writable (sidecar not ready, crashed, or stopped).
    #[error("sidecar not connected")]
    NotConnected,

    /// The module client was destroyed; it no longer accepts commands.
    #[error("module client destroyed")]
    Destroyed,

    /// No session with this id exists on the client.
    #[error("unknown session: {id}")]
    UnknownSession {
        /// Session id the caller named.
        id: String,
    },

    /// The command failed to serialize into an envelope.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
