//! Client runtime for a locally spawned sidecar process.
//!
//! The sidecar is a separate binary speaking a framed, multiplexed protocol
//! over its stdio (see `tether-proto`). This crate owns everything on the
//! client side of that pipe:
//!
//! - [`supervisor`]: spawn, readiness, crash detection, restart with backoff
//! - [`transport`]: framed stdio I/O with a bounded, load-shedding send queue
//! - [`router`]: envelope dispatch to per-module handlers
//! - [`llm`] / [`terminal`]: typed module clients with event subscriptions
//! - [`binary`]: platform binary naming and checksum verification
//! - [`context`]: the composition root tying all of the above together
//!
//! Most callers only need [`SidecarContext`]:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tether_client::{ContextConfig, SidecarContext};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let context = SidecarContext::launch(ContextConfig::new("./bin".into()))?;
//! context.await_ready(Duration::from_secs(10)).await?;
//!
//! let terminal_id = context.terminal().create_terminal(Default::default())?;
//! context.terminal().write(&terminal_id, "ls\n")?;
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod context;
pub mod error;
pub mod events;
pub mod llm;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod terminal;
pub mod transport;

pub use context::{ContextConfig, SidecarContext};
pub use error::{SendError, SpawnError, SupervisorError};
pub use events::{Event, HandlerId, SharedRegistry};
pub use llm::{LlmClient, LlmEvent, LlmEventKind};
pub use router::{LinkEvent, ModuleHandler, Router};
pub use session::{StreamSession, StreamState, StreamUpdate};
pub use supervisor::{
    CrashInfo, ProcessState, RestartPolicy, Supervisor, SupervisorConfig,
};
pub use terminal::{
    Attachment, PtyState, SearchState, TerminalClient, TerminalEvent, TerminalEventKind,
    TerminalInstance,
};
pub use transport::{Transport, TransportConfig, TransportEvent};
