//! Composition root: one sidecar, one router, the module clients.
//!
//! [`SidecarContext::launch`] wires everything together in the right order:
//! resolve (and optionally verify) the binary, build the router, register
//! the module clients, then hand the router to a supervisor and start it.
//! Callers hold the context for the lifetime of the sidecar and talk to the
//! sidecar exclusively through the clients it exposes.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    binary::{resolve_binary, verify_checksum},
    error::{SpawnError, SupervisorError},
    llm::LlmClient,
    router::Router,
    supervisor::{ProcessState, RestartPolicy, Supervisor, SupervisorConfig},
    terminal::TerminalClient,
    transport::TransportConfig,
};

/// Everything needed to locate and run a sidecar.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Directory holding the platform-named sidecar binaries.
    pub binary_dir: PathBuf,

    /// Base binary name before platform qualification.
    pub base_name: String,

    /// Client version advertised to the sidecar.
    pub version: Option<String>,

    /// Verify the binary against its detached `.sha256` before launching.
    ///
    /// Off by default: local development builds do not ship checksums.
    pub verify_checksum: bool,

    /// How long a freshly spawned sidecar gets to announce readiness.
    pub ready_timeout: Duration,

    /// Graceful-stop window before the process is killed.
    pub grace_period: Duration,

    /// Restart budget and backoff.
    pub restart: RestartPolicy,

    /// Transport tuning.
    pub transport: TransportConfig,
}

impl ContextConfig {
    /// Base name released sidecar binaries are published under.
    pub const DEFAULT_BASE_NAME: &'static str = "tether-sidecar";

    /// Config with defaults for everything but the binary directory.
    #[must_use]
    pub fn new(binary_dir: PathBuf) -> Self {
        Self {
            binary_dir,
            base_name: Self::DEFAULT_BASE_NAME.to_owned(),
            version: None,
            verify_checksum: false,
            ready_timeout: SupervisorConfig::DEFAULT_READY_TIMEOUT,
            grace_period: SupervisorConfig::DEFAULT_GRACE_PERIOD,
            restart: RestartPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// A running sidecar and the clients that talk to it.
pub struct SidecarContext {
    router: Arc<Router>,
    supervisor: Supervisor,
    llm: LlmClient,
    terminal: TerminalClient,
}

impl fmt::Debug for SidecarContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarContext").finish_non_exhaustive()
    }
}

impl SidecarContext {
    /// Resolve the binary and start the sidecar.
    ///
    /// Returns as soon as the supervisor is launched; use
    /// [`SidecarContext::await_ready`] to wait for the sidecar itself.
    ///
    /// # Errors
    ///
    /// Binary resolution and checksum failures; see [`SpawnError`].
    pub fn launch(config: ContextConfig) -> Result<Self, SpawnError> {
        let binary = resolve_binary(&config.binary_dir, &config.base_name)?;
        if config.verify_checksum {
            verify_checksum(&binary)?;
        }
        tracing::info!(binary = %binary.display(), "launching sidecar");

        let router = Arc::new(Router::new());
        let llm = LlmClient::new(Arc::clone(&router));
        let terminal = TerminalClient::new(Arc::clone(&router));

        let supervisor = Supervisor::spawn(
            SupervisorConfig {
                binary,
                version: config.version,
                ready_timeout: config.ready_timeout,
                grace_period: config.grace_period,
                restart: config.restart,
                transport: config.transport,
            },
            Arc::clone(&router),
        );
        supervisor.start();

        Ok(Self { router, supervisor, llm, terminal })
    }

    /// The envelope router shared by every module client.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The LLM streaming client.
    #[must_use]
    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    /// The terminal client.
    #[must_use]
    pub fn terminal(&self) -> &TerminalClient {
        &self.terminal
    }

    /// Current sidecar lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// Wait until the sidecar announces readiness.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::await_ready`].
    pub async fn await_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        self.supervisor.await_ready(timeout).await
    }

    /// Tear everything down: module clients first, then the process.
    pub fn shutdown(&self) {
        self.llm.destroy();
        self.terminal.destroy();
        self.supervisor.stop();
    }
}
