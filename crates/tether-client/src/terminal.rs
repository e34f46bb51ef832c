//! Terminal module client: many PTY sessions over one module.
//!
//! Each session is identified by a client-allocated terminal id that rides
//! in the envelope's `request_id`, so output from one terminal never blocks
//! or misroutes another. The client tracks a local mirror of every session
//! (title, attachment, search state, liveness); the PTY itself lives in the
//! sidecar.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tether_proto::{
    Envelope,
    envelope::{envelope_from_message, message_from_envelope, modules},
    payloads::terminal::{CreateTerminal, TerminalCommand, TerminalServerMessage},
};

use crate::{
    error::SendError,
    events::{Event, HandlerId, SharedRegistry},
    router::{LinkEvent, ModuleHandler, Router},
};

/// Liveness of the sidecar-side PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyState {
    /// The shell process is running.
    Running,
    /// The shell process exited; the session remains for inspection until
    /// destroyed.
    Exited {
        /// Exit code, when the platform reports one.
        code: Option<i32>,
    },
}

/// Whether a UI surface is currently showing this terminal.
///
/// Purely local bookkeeping; the sidecar keeps producing output either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attachment {
    /// No surface is showing the terminal.
    #[default]
    Detached,
    /// A surface is showing the terminal.
    Attached,
}

/// Local scrollback-search state for one terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchState {
    /// Active query, if a search is open.
    pub query: Option<String>,
    /// Index of the highlighted match.
    pub match_index: usize,
}

/// Snapshot of one tracked terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInstance {
    /// Session id (the envelope `request_id` for this terminal).
    pub id: String,
    /// Last title reported or locally assigned.
    pub title: String,
    /// Whether a UI surface is attached.
    pub attachment: Attachment,
    /// Local search state.
    pub search: SearchState,
    /// Liveness of the sidecar-side PTY.
    pub state: PtyState,
}

impl TerminalInstance {
    fn new(id: String) -> Self {
        Self {
            id,
            title: String::new(),
            attachment: Attachment::Detached,
            search: SearchState::default(),
            state: PtyState::Running,
        }
    }
}

/// Events surfaced to terminal subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// PTY output for one session.
    Data {
        /// Session the output belongs to.
        terminal_id: String,
        /// Raw output text in arrival order.
        data: String,
    },

    /// A session's shell process exited.
    Exit {
        /// Session that finished.
        terminal_id: String,
        /// Exit code, when reported.
        code: Option<i32>,
    },

    /// A session's title changed (program-driven or local rename).
    TitleChanged {
        /// Session whose title changed.
        terminal_id: String,
        /// New title text.
        title: String,
    },

    /// A session-level or module-wide failure.
    Error {
        /// Affected session; `None` for module-wide failures.
        terminal_id: Option<String>,
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

/// Subscription discriminant for [`TerminalEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEventKind {
    /// PTY output.
    Data,
    /// Shell exits.
    Exit,
    /// Title changes.
    TitleChanged,
    /// Session and module errors.
    Error,
}

impl Event for TerminalEvent {
    type Kind = TerminalEventKind;

    fn kind(&self) -> TerminalEventKind {
        match self {
            Self::Data { .. } => TerminalEventKind::Data,
            Self::Exit { .. } => TerminalEventKind::Exit,
            Self::TitleChanged { .. } => TerminalEventKind::TitleChanged,
            Self::Error { .. } => TerminalEventKind::Error,
        }
    }
}

struct TerminalModuleState {
    sessions: HashMap<String, TerminalInstance>,
    destroyed: bool,
    counter: u64,
    nonce: u64,
}

/// Router-facing half of the terminal client.
struct TerminalHandler {
    state: Mutex<TerminalModuleState>,
    registry: SharedRegistry<TerminalEvent>,
}

/// Handle for driving PTY sessions through the sidecar.
pub struct TerminalClient {
    handler: Arc<TerminalHandler>,
    router: Arc<Router>,
}

impl TerminalClient {
    /// Create the client and register it with `router`.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        let handler = Arc::new(TerminalHandler {
            state: Mutex::new(TerminalModuleState {
                sessions: HashMap::new(),
                destroyed: false,
                counter: 0,
                nonce: rand::random(),
            }),
            registry: SharedRegistry::new(),
        });
        router.register(&(Arc::clone(&handler) as Arc<dyn ModuleHandler>));
        Self { handler, router }
    }

    /// Subscribe to one kind of terminal event.
    pub fn on(
        &self,
        kind: TerminalEventKind,
        handler: impl Fn(&TerminalEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.handler.registry.on(kind, handler)
    }

    /// Remove a subscription made with [`TerminalClient::on`].
    pub fn off(&self, id: HandlerId) -> bool {
        self.handler.registry.off(id)
    }

    /// Snapshot of one tracked session.
    #[must_use]
    pub fn terminal(&self, id: &str) -> Option<TerminalInstance> {
        self.handler.lock().sessions.get(id).cloned()
    }

    /// Snapshots of every tracked session, in unspecified order.
    #[must_use]
    pub fn terminals(&self) -> Vec<TerminalInstance> {
        self.handler.lock().sessions.values().cloned().collect()
    }

    /// Create a new PTY session, returning its terminal id.
    ///
    /// # Errors
    ///
    /// - [`SendError::Destroyed`] after [`TerminalClient::destroy`]
    /// - [`SendError::NotConnected`] while the sidecar is down
    /// - [`SendError::Protocol`] if the options fail to serialize
    pub fn create_terminal(&self, options: CreateTerminal) -> Result<String, SendError> {
        let mut state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }

        state.counter += 1;
        let id = format!("term-{:016x}-{}", state.nonce, state.counter);

        let envelope = envelope_from_message(
            modules::TERMINAL,
            Some(id.clone()),
            &TerminalCommand::Create(options),
        )?;
        self.router.send(envelope)?;

        state.sessions.insert(id.clone(), TerminalInstance::new(id.clone()));
        Ok(id)
    }

    /// Feed input to a running session.
    ///
    /// # Errors
    ///
    /// - [`SendError::Destroyed`] after [`TerminalClient::destroy`]
    /// - [`SendError::UnknownSession`] if `id` is untracked or has exited
    /// - [`SendError::NotConnected`] while the sidecar is down
    pub fn write(&self, id: &str, data: impl Into<String>) -> Result<(), SendError> {
        self.send_to_running(id, &TerminalCommand::Write { data: data.into() })
    }

    /// Resize a running session's PTY.
    ///
    /// # Errors
    ///
    /// Same as [`TerminalClient::write`].
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SendError> {
        self.send_to_running(id, &TerminalCommand::Resize { cols, rows })
    }

    /// Terminate a session and stop tracking it.
    ///
    /// The sidecar is told to tear the PTY down; output frames that raced
    /// the destroy are discarded because the id is no longer tracked.
    ///
    /// # Errors
    ///
    /// - [`SendError::Destroyed`] after [`TerminalClient::destroy`]
    /// - [`SendError::UnknownSession`] if `id` is untracked
    pub fn destroy_terminal(&self, id: &str) -> Result<(), SendError> {
        let mut state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }
        if state.sessions.remove(id).is_none() {
            return Err(SendError::UnknownSession { id: id.to_owned() });
        }

        let envelope =
            envelope_from_message(modules::TERMINAL, Some(id.to_owned()), &TerminalCommand::Destroy)?;
        // The local session is gone either way; a dead transport just means
        // the sidecar-side PTY already died with the sidecar.
        if let Err(error) = self.router.send(envelope) {
            tracing::debug!(%error, terminal_id = %id, "destroy command not delivered");
        }
        Ok(())
    }

    /// Rename a session locally and notify subscribers.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] / [`SendError::UnknownSession`] as above.
    pub fn rename(&self, id: &str, title: impl Into<String>) -> Result<(), SendError> {
        let title = title.into();
        self.with_session(id, |session| {
            session.title.clone_from(&title);
        })?;
        self.handler.registry.emit(&TerminalEvent::TitleChanged {
            terminal_id: id.to_owned(),
            title,
        });
        Ok(())
    }

    /// Mark a session as shown by a UI surface.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] / [`SendError::UnknownSession`] as above.
    pub fn attach(&self, id: &str) -> Result<(), SendError> {
        self.with_session(id, |session| session.attachment = Attachment::Attached)
    }

    /// Mark a session as no longer shown.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] / [`SendError::UnknownSession`] as above.
    pub fn detach(&self, id: &str) -> Result<(), SendError> {
        self.with_session(id, |session| session.attachment = Attachment::Detached)
    }

    /// Open or update a session's scrollback search.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] / [`SendError::UnknownSession`] as above.
    pub fn set_search(&self, id: &str, query: impl Into<String>, match_index: usize) -> Result<(), SendError> {
        let query = query.into();
        self.with_session(id, |session| {
            session.search = SearchState { query: Some(query.clone()), match_index };
        })
    }

    /// Close a session's scrollback search.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] / [`SendError::UnknownSession`] as above.
    pub fn clear_search(&self, id: &str) -> Result<(), SendError> {
        self.with_session(id, |session| session.search = SearchState::default())
    }

    /// Tear the client down: stop tracking every session, drop all
    /// subscriptions, stop receiving from the router. Idempotent.
    ///
    /// Sidecar-side PTYs are torn down with a best-effort destroy per
    /// session.
    pub fn destroy(&self) {
        let ids: Vec<String> = {
            let mut state = self.handler.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.sessions.drain().map(|(id, _)| id).collect()
        };

        for id in ids {
            if let Ok(envelope) =
                envelope_from_message(modules::TERMINAL, Some(id), &TerminalCommand::Destroy)
                && let Err(error) = self.router.send(envelope)
            {
                tracing::debug!(%error, "destroy command not delivered");
            }
        }
        self.handler.registry.clear();
        self.router.unregister(modules::TERMINAL);
    }

    fn send_to_running(&self, id: &str, command: &TerminalCommand) -> Result<(), SendError> {
        let state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }
        match state.sessions.get(id) {
            Some(session) if session.state == PtyState::Running => {},
            _ => return Err(SendError::UnknownSession { id: id.to_owned() }),
        }

        let envelope = envelope_from_message(modules::TERMINAL, Some(id.to_owned()), command)?;
        self.router.send(envelope)
    }

    fn with_session(
        &self,
        id: &str,
        update: impl FnOnce(&mut TerminalInstance),
    ) -> Result<(), SendError> {
        let mut state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }
        match state.sessions.get_mut(id) {
            Some(session) => {
                update(session);
                Ok(())
            },
            None => Err(SendError::UnknownSession { id: id.to_owned() }),
        }
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl TerminalHandler {
    fn lock(&self) -> MutexGuard<'_, TerminalModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModuleHandler for TerminalHandler {
    fn module(&self) -> &'static str {
        modules::TERMINAL
    }

    fn handle_envelope(&self, envelope: Envelope) {
        let message: TerminalServerMessage = match message_from_envelope(&envelope) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, kind = %envelope.kind, "dropping unrecognized terminal message");
                return;
            },
        };

        let Some(terminal_id) = envelope.request_id else {
            // Module-wide failures come without a session id.
            if let TerminalServerMessage::Error { code, message } = message {
                self.registry.emit(&TerminalEvent::Error { terminal_id: None, code, message });
            } else {
                tracing::warn!("dropping terminal message without a session id");
            }
            return;
        };

        let event = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            let Some(session) = state.sessions.get_mut(&terminal_id) else {
                // Destroyed session's frames raced the destroy command.
                tracing::debug!(%terminal_id, "discarding output for untracked terminal");
                return;
            };

            match message {
                TerminalServerMessage::Data { data } => {
                    TerminalEvent::Data { terminal_id, data }
                },
                TerminalServerMessage::Exit { code } => {
                    session.state = PtyState::Exited { code };
                    TerminalEvent::Exit { terminal_id, code }
                },
                TerminalServerMessage::TitleChanged { title } => {
                    session.title.clone_from(&title);
                    TerminalEvent::TitleChanged { terminal_id, title }
                },
                TerminalServerMessage::Error { code, message } => {
                    TerminalEvent::Error { terminal_id: Some(terminal_id), code, message }
                },
            }
        };

        self.registry.emit(&event);
    }

    fn handle_link(&self, link: &LinkEvent) {
        let events = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            match link {
                LinkEvent::Lost { reason } => {
                    // PTYs die with the sidecar; they do not survive restart.
                    let mut events = Vec::new();
                    for session in state.sessions.values_mut() {
                        if session.state == PtyState::Running {
                            session.state = PtyState::Exited { code: None };
                            events.push(TerminalEvent::Exit {
                                terminal_id: session.id.clone(),
                                code: None,
                            });
                        }
                    }
                    events.push(TerminalEvent::Error {
                        terminal_id: None,
                        code: "sidecar_lost".to_owned(),
                        message: reason.clone(),
                    });
                    events
                },
                LinkEvent::Unavailable => vec![TerminalEvent::Error {
                    terminal_id: None,
                    code: "sidecar_unavailable".to_owned(),
                    message: "restart budget exhausted".to_owned(),
                }],
                LinkEvent::SendDropped { envelope } => match &envelope.request_id {
                    Some(id) if state.sessions.contains_key(id) => vec![TerminalEvent::Error {
                        terminal_id: Some(id.clone()),
                        code: "transport_overflow".to_owned(),
                        message: "command shed by the send queue".to_owned(),
                    }],
                    _ => Vec::new(),
                },
                LinkEvent::Restored => Vec::new(),
            }
        };

        for event in &events {
            self.registry.emit(event);
        }
    }
}
