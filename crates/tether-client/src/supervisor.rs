//! Sidecar process lifecycle.
//!
//! One spawned task owns the child process end to end: spawn, readiness,
//! crash detection, restart with backoff, graceful stop. Everything else
//! observes it through channels — a `watch` for the current state, a
//! `broadcast` for crash notifications, and the router's transport gate for
//! send availability.
//!
//! # Lifecycle
//!
//! `Stopped -> Starting -> Ready`, then on process death
//! `Crashed -> Starting -> ...` until the restart budget runs out, which
//! parks the supervisor at `Unavailable`. A crash-free span ending in
//! readiness resets the budget: only consecutive failures count against it.
//! Readiness is the first `system/ready` envelope, not a successful spawn;
//! a sidecar that launches but never speaks is treated as crashed.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tether_proto::envelope::modules;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command as ProcessCommand},
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    error::{SpawnError, SupervisorError},
    router::{LinkEvent, Router},
    transport::{Transport, TransportConfig, TransportEvent},
};

/// Environment variable telling the sidecar which client launched it.
pub const VERSION_ENV: &str = "TETHER_SIDECAR_VERSION";

/// Restart budget and backoff schedule for consecutive crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive crashes tolerated before giving up.
    pub max_restarts: u32,
    /// Delay before the first restart; doubles per consecutive crash.
    pub backoff_base: Duration,
    /// Upper bound on the delay.
    pub backoff_cap: Duration,
}

impl RestartPolicy {
    /// Default restart budget.
    pub const DEFAULT_MAX_RESTARTS: u32 = 3;

    /// Default base backoff delay.
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

    /// Default backoff ceiling.
    pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(8);

    /// Delay before restart attempt `attempt` (1-based), or `None` when the
    /// budget is exhausted.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_restarts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.backoff_base.saturating_mul(factor).min(self.backoff_cap))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: Self::DEFAULT_MAX_RESTARTS,
            backoff_base: Self::DEFAULT_BACKOFF_BASE,
            backoff_cap: Self::DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Everything the supervisor needs to run one sidecar binary.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Resolved path to the sidecar binary.
    pub binary: PathBuf,

    /// Client version advertised to the sidecar via [`VERSION_ENV`].
    pub version: Option<String>,

    /// How long a freshly spawned sidecar gets to announce readiness.
    pub ready_timeout: Duration,

    /// How long a stopping sidecar gets to exit after stdin closes before
    /// it is killed.
    pub grace_period: Duration,

    /// Restart budget and backoff.
    pub restart: RestartPolicy,

    /// Transport tuning.
    pub transport: TransportConfig,
}

impl SupervisorConfig {
    /// Default readiness deadline.
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default graceful-stop window.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

    /// Config with defaults for everything but the binary path.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            version: None,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            restart: RestartPolicy::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Where the sidecar process is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not running and not asked to run.
    Stopped,
    /// Spawned, waiting for the readiness announcement.
    Starting,
    /// Announced readiness; commands flow.
    Ready,
    /// Died unexpectedly; a restart may be pending.
    Crashed,
    /// Restart budget exhausted; parked until explicitly started again.
    Unavailable,
}

/// One unexpected sidecar death.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashInfo {
    /// Process exit code, when the platform reports one.
    pub code: Option<i32>,
    /// Consecutive crashes including this one.
    pub crash_count: u32,
    /// Whether the supervisor will attempt another restart.
    pub will_restart: bool,
}

enum Command {
    Start,
    Stop,
}

/// Handle to the lifecycle task.
///
/// Dropping the supervisor aborts the task; `kill_on_drop` takes the child
/// down with it.
pub struct Supervisor {
    control: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ProcessState>,
    crashes: broadcast::Sender<CrashInfo>,
    restarts: Arc<AtomicU32>,
    last_error: Arc<Mutex<Option<SupervisorError>>>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Create the lifecycle task. The sidecar is not launched until
    /// [`Supervisor::start`].
    #[must_use]
    pub fn spawn(config: SupervisorConfig, router: Arc<Router>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);
        let (crashes, _) = broadcast::channel(16);
        let restarts = Arc::new(AtomicU32::new(0));
        let last_error = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run_lifecycle(Lifecycle {
            config,
            router,
            control: control_rx,
            state: state_tx,
            crashes: crashes.clone(),
            restarts: Arc::clone(&restarts),
            last_error: Arc::clone(&last_error),
        }));

        Self { control: control_tx, state_rx, crashes, restarts, last_error, task }
    }

    /// Ask the lifecycle task to launch the sidecar.
    ///
    /// A no-op while the sidecar is already running; also how a parked
    /// `Unavailable` supervisor is given a fresh restart budget.
    pub fn start(&self) {
        let _ = self.control.send(Command::Start);
    }

    /// Ask the lifecycle task to stop the sidecar gracefully.
    ///
    /// Closes the sidecar's stdin, waits out the grace period, then kills.
    /// A no-op when nothing is running.
    pub fn stop(&self) {
        let _ = self.control.send(Command::Stop);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Subscribe to crash notifications.
    #[must_use]
    pub fn subscribe_crashes(&self) -> broadcast::Receiver<CrashInfo> {
        self.crashes.subscribe()
    }

    /// Consecutive crashes in the current failure span.
    #[must_use]
    pub fn crash_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// The most recent terminal failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<SupervisorError> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until the sidecar is ready, a failure becomes terminal, or
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::ReadyTimeout`] if `timeout` elapses first
    /// - [`SupervisorError::Unavailable`] once the restart budget is gone
    /// - [`SupervisorError::Spawn`] if the binary could not be launched
    /// - [`SupervisorError::Stopped`] if the lifecycle task went away
    pub async fn await_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut state_rx = self.state_rx.clone();

        let wait = async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ProcessState::Ready => return Ok(()),
                    ProcessState::Unavailable => {
                        return Err(self.last_error().unwrap_or(SupervisorError::Unavailable {
                            crashes: self.crash_count(),
                        }));
                    },
                    ProcessState::Stopped => {
                        // A spawn failure parks the task at Stopped with the
                        // error recorded; surface it instead of timing out.
                        if let Some(error @ SupervisorError::Spawn(_)) = self.last_error() {
                            return Err(error);
                        }
                    },
                    ProcessState::Starting | ProcessState::Crashed => {},
                }
                if state_rx.changed().await.is_err() {
                    return Err(SupervisorError::Stopped);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::ReadyTimeout { elapsed: timeout }),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Lifecycle {
    config: SupervisorConfig,
    router: Arc<Router>,
    control: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ProcessState>,
    crashes: broadcast::Sender<CrashInfo>,
    restarts: Arc<AtomicU32>,
    last_error: Arc<Mutex<Option<SupervisorError>>>,
}

impl Lifecycle {
    fn set_state(&self, state: ProcessState) {
        let _ = self.state.send(state);
    }

    fn record_error(&self, error: Option<SupervisorError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

/// Why one run of the child ended.
enum RunEnd {
    /// Unexpected death; consult the restart budget.
    Crashed { code: Option<i32>, reason: String },
    /// Deliberate stop; park without touching the budget.
    Stopped,
    /// Control channel gone; the supervisor handle was dropped.
    Detached,
}

async fn run_lifecycle(mut lifecycle: Lifecycle) {
    loop {
        // Parked: wait for a start command. State is whatever the last run
        // left behind (Stopped or Unavailable).
        match lifecycle.control.recv().await {
            Some(Command::Start) => {},
            Some(Command::Stop) => continue,
            None => return,
        }

        lifecycle.restarts.store(0, Ordering::SeqCst);
        lifecycle.record_error(None);

        // One failure span: run and restart until stopped, detached, or out
        // of budget.
        loop {
            match run_once(&mut lifecycle).await {
                RunEnd::Stopped => {
                    lifecycle.set_state(ProcessState::Stopped);
                    break;
                },
                RunEnd::Detached => return,
                RunEnd::Crashed { code, reason } => {
                    let crash_count = lifecycle.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    let backoff = lifecycle.config.restart.backoff(crash_count);

                    lifecycle.set_state(ProcessState::Crashed);
                    let _ = lifecycle.crashes.send(CrashInfo {
                        code,
                        crash_count,
                        will_restart: backoff.is_some(),
                    });
                    lifecycle.router.broadcast_link(&LinkEvent::Lost { reason: reason.clone() });

                    let Some(delay) = backoff else {
                        tracing::error!(crash_count, "sidecar restart budget exhausted");
                        lifecycle
                            .record_error(Some(SupervisorError::Unavailable { crashes: crash_count }));
                        lifecycle.set_state(ProcessState::Unavailable);
                        lifecycle.router.broadcast_link(&LinkEvent::Unavailable);
                        break;
                    };

                    tracing::warn!(?code, crash_count, ?delay, "sidecar crashed, restarting");
                    // A stop during backoff cancels the restart.
                    let stop_during_backoff = tokio::select! {
                        () = tokio::time::sleep(delay) => false,
                        command = lifecycle.control.recv() => match command {
                            Some(Command::Stop) => true,
                            Some(Command::Start) => false,
                            None => return,
                        },
                    };
                    if stop_during_backoff {
                        lifecycle.set_state(ProcessState::Stopped);
                        break;
                    }
                },
            }
        }
    }
}

/// Spawn the child and drive it until it ends one way or another.
async fn run_once(lifecycle: &mut Lifecycle) -> RunEnd {
    lifecycle.set_state(ProcessState::Starting);

    let mut child = match spawn_child(&lifecycle.config) {
        Ok(child) => child,
        Err(error) => {
            tracing::error!(%error, binary = %lifecycle.config.binary.display(), "sidecar spawn failed");
            lifecycle.record_error(Some(SupervisorError::Spawn(error)));
            lifecycle.set_state(ProcessState::Stopped);
            return RunEnd::Stopped;
        },
    };

    // Pipes were requested at spawn; their absence is unreachable in
    // practice but cheap to turn into a crash instead of a panic.
    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
        let _ = child.start_kill();
        return RunEnd::Crashed { code: None, reason: "sidecar pipes missing".to_owned() };
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr));
    }

    let (transport, mut events) = Transport::spawn(stdout, stdin, lifecycle.config.transport);

    let mut ready = false;
    let ready_deadline = tokio::time::sleep_until(Instant::now() + lifecycle.config.ready_timeout);
    tokio::pin!(ready_deadline);

    // Select arms only name what happened; all handling runs afterwards so
    // no arm needs to borrow the child or the lifecycle while the other
    // futures are still alive.
    enum Step {
        ReadyDeadline,
        Transport(Option<TransportEvent>),
        Control(Option<Command>),
        Exited(Option<i32>),
    }

    let end = loop {
        let step = tokio::select! {
            () = &mut ready_deadline, if !ready => Step::ReadyDeadline,
            event = events.recv() => Step::Transport(event),
            command = lifecycle.control.recv() => Step::Control(command),
            status = child.wait() => {
                Step::Exited(status.ok().and_then(|status| status.code()))
            },
        };

        match step {
            Step::ReadyDeadline => {
                tracing::error!(
                    timeout = ?lifecycle.config.ready_timeout,
                    "sidecar never announced readiness"
                );
                lifecycle.record_error(Some(SupervisorError::ReadyTimeout {
                    elapsed: lifecycle.config.ready_timeout,
                }));
                break RunEnd::Crashed { code: None, reason: "readiness timeout".to_owned() };
            },

            Step::Transport(Some(TransportEvent::Envelope(envelope))) => {
                if !ready && envelope.module == modules::SYSTEM && envelope.kind == "ready" {
                    ready = true;
                    let restored = lifecycle.restarts.load(Ordering::SeqCst) > 0;
                    lifecycle.restarts.store(0, Ordering::SeqCst);
                    lifecycle.router.set_transport(Some(transport.clone()));
                    lifecycle.set_state(ProcessState::Ready);
                    tracing::info!(restored, "sidecar ready");
                    if restored {
                        lifecycle.router.broadcast_link(&LinkEvent::Restored);
                    }
                } else {
                    lifecycle.router.dispatch(envelope);
                }
            },
            Step::Transport(Some(TransportEvent::Overflow { envelope, dropped })) => {
                lifecycle.router.notify_overflow(envelope, dropped);
            },
            Step::Transport(Some(TransportEvent::Closed) | None) => {
                let code = wait_exit_code(&mut child, Duration::from_millis(250)).await;
                break RunEnd::Crashed { code, reason: format!("pipe closed (exit code {code:?})") };
            },

            Step::Control(Some(Command::Start)) => {},
            Step::Control(Some(Command::Stop)) => {
                lifecycle.router.set_transport(None);
                transport.shutdown();
                graceful_stop(&mut child, lifecycle.config.grace_period).await;
                break RunEnd::Stopped;
            },
            Step::Control(None) => {
                let _ = child.start_kill();
                break RunEnd::Detached;
            },

            Step::Exited(code) => {
                break RunEnd::Crashed { code, reason: format!("process exited (code {code:?})") };
            },
        }
    };

    // No envelope may be sent into a dead run.
    lifecycle.router.set_transport(None);
    transport.shutdown();
    end
}

fn spawn_child(config: &SupervisorConfig) -> Result<Child, SpawnError> {
    let mut command = ProcessCommand::new(&config.binary);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(version) = &config.version {
        command.env(VERSION_ENV, version);
    }

    command.spawn().map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound => SpawnError::Missing { path: config.binary.clone() },
        std::io::ErrorKind::PermissionDenied => {
            SpawnError::NotExecutable { path: config.binary.clone() }
        },
        _ => SpawnError::Io { path: config.binary.clone(), message: error.to_string() },
    })
}

/// Mirror the sidecar's stderr into the log, line by line.
async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "sidecar", "{line}");
    }
}

/// Give the child `grace` to exit on its own, then kill it.
async fn graceful_stop(child: &mut Child, grace: Duration) {
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!("sidecar ignored stdin close, killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Best-effort exit code after a pipe closed; the process may still be
/// mid-exit when we look.
async fn wait_exit_code(child: &mut Child, grace: Duration) -> Option<i32> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        },
    }
}
