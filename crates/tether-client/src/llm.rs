//! LLM module client: one inference stream at a time.
//!
//! The client owns at most one [`StreamSession`]. Starting a stream while
//! another is active cancels the old one implicitly, matching what a chat
//! UI wants when the user resubmits: the sidecar is told to tear the old
//! stream down, its late frames are discarded by the request-id filter, and
//! subscribers only ever see events for the newest request.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_proto::{
    Envelope,
    envelope::{envelope_from_message, message_from_envelope, modules},
    payloads::llm::{LlmCommand, LlmServerMessage, StreamStart},
};

use crate::{
    error::SendError,
    events::{Event, HandlerId, SharedRegistry},
    router::{LinkEvent, ModuleHandler, Router},
    session::{StreamSession, StreamState, StreamUpdate},
};

/// Events surfaced to LLM subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmEvent {
    /// Partial response text for the named stream.
    Chunk {
        /// Stream the fragment belongs to.
        request_id: String,
        /// Text fragment in arrival order.
        content: String,
    },

    /// Partial reasoning text for the named stream.
    Thinking {
        /// Stream the fragment belongs to.
        request_id: String,
        /// Thinking fragment in arrival order.
        content: String,
    },

    /// The named stream finished successfully.
    Complete {
        /// Stream that finished.
        request_id: String,
        /// Full response text.
        full_content: String,
    },

    /// A stream failed, or the module failed as a whole.
    Error {
        /// Stream the error belongs to; `None` for module-wide failures.
        request_id: Option<String>,
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

/// Subscription discriminant for [`LlmEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmEventKind {
    /// Response text fragments.
    Chunk,
    /// Reasoning text fragments.
    Thinking,
    /// Successful completions.
    Complete,
    /// Stream and module errors.
    Error,
}

impl Event for LlmEvent {
    type Kind = LlmEventKind;

    fn kind(&self) -> LlmEventKind {
        match self {
            Self::Chunk { .. } => LlmEventKind::Chunk,
            Self::Thinking { .. } => LlmEventKind::Thinking,
            Self::Complete { .. } => LlmEventKind::Complete,
            Self::Error { .. } => LlmEventKind::Error,
        }
    }
}

struct LlmState {
    session: Option<StreamSession>,
    destroyed: bool,
    counter: u64,
    nonce: u64,
}

/// Router-facing half of the LLM client.
struct LlmHandler {
    state: Mutex<LlmState>,
    registry: SharedRegistry<LlmEvent>,
}

/// Handle for driving inference streams through the sidecar.
pub struct LlmClient {
    handler: Arc<LlmHandler>,
    router: Arc<Router>,
}

impl LlmClient {
    /// Create the client and register it with `router`.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        let handler = Arc::new(LlmHandler {
            state: Mutex::new(LlmState {
                session: None,
                destroyed: false,
                counter: 0,
                nonce: rand::random(),
            }),
            registry: SharedRegistry::new(),
        });
        router.register(&(Arc::clone(&handler) as Arc<dyn ModuleHandler>));
        Self { handler, router }
    }

    /// Subscribe to one kind of stream event.
    pub fn on(&self, kind: LlmEventKind, handler: impl Fn(&LlmEvent) + Send + Sync + 'static) -> HandlerId {
        self.handler.registry.on(kind, handler)
    }

    /// Remove a subscription made with [`LlmClient::on`].
    pub fn off(&self, id: HandlerId) -> bool {
        self.handler.registry.off(id)
    }

    /// State of the current stream, if one exists.
    #[must_use]
    pub fn stream_state(&self) -> Option<StreamState> {
        self.handler.lock().session.as_ref().map(StreamSession::state)
    }

    /// Start a new inference stream, returning its request id.
    ///
    /// An active stream is cancelled implicitly first; its late frames are
    /// discarded, not surfaced.
    ///
    /// # Errors
    ///
    /// - [`SendError::Destroyed`] after [`LlmClient::destroy`]
    /// - [`SendError::NotConnected`] while the sidecar is down
    /// - [`SendError::Protocol`] if the parameters fail to serialize
    pub fn start_stream(&self, params: StreamStart) -> Result<String, SendError> {
        let mut state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }

        if let Some(session) = state.session.as_mut()
            && session.cancel()
        {
            let stale_id = session.request_id().to_owned();
            tracing::debug!(request_id = %stale_id, "implicitly cancelling active stream");
            self.send_cancel(&stale_id);
        }

        state.counter += 1;
        let request_id = format!("req-{:016x}-{}", state.nonce, state.counter);

        let envelope = envelope_from_message(
            modules::LLM,
            Some(request_id.clone()),
            &LlmCommand::StreamStart(params),
        )?;
        self.router.send(envelope)?;

        let mut session = StreamSession::new(request_id.clone());
        session.start();
        state.session = Some(session);

        Ok(request_id)
    }

    /// Cancel the active stream, if any.
    ///
    /// The session is cancelled locally before the sidecar is told, so late
    /// frames are already stale by the time this returns. Calling with no
    /// active stream is a no-op.
    ///
    /// # Errors
    ///
    /// [`SendError::Destroyed`] after [`LlmClient::destroy`]. A transport
    /// failure on the cancel command itself is not an error: the local
    /// session is cancelled regardless, and a dead sidecar has no stream
    /// left to tear down.
    pub fn cancel_stream(&self) -> Result<(), SendError> {
        let mut state = self.handler.lock();
        if state.destroyed {
            return Err(SendError::Destroyed);
        }

        if let Some(session) = state.session.as_mut()
            && session.cancel()
        {
            let request_id = session.request_id().to_owned();
            self.send_cancel(&request_id);
        }
        Ok(())
    }

    /// Tear the client down: cancel any stream, drop all subscriptions,
    /// stop receiving from the router. Idempotent.
    pub fn destroy(&self) {
        let cancel_id = {
            let mut state = self.handler.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state
                .session
                .as_mut()
                .and_then(|session| session.cancel().then(|| session.request_id().to_owned()))
        };

        if let Some(request_id) = cancel_id {
            self.send_cancel(&request_id);
        }
        self.handler.registry.clear();
        self.router.unregister(modules::LLM);
    }

    /// Best-effort cancel command; a dead transport is not an error here.
    fn send_cancel(&self, request_id: &str) {
        let envelope =
            envelope_from_message(modules::LLM, Some(request_id.to_owned()), &LlmCommand::StreamCancel);
        match envelope {
            Ok(envelope) => {
                if let Err(error) = self.router.send(envelope) {
                    tracing::debug!(%error, request_id, "cancel command not delivered");
                }
            },
            Err(error) => tracing::error!(%error, "cancel command failed to serialize"),
        }
    }
}

impl Drop for LlmClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl LlmHandler {
    fn lock(&self) -> MutexGuard<'_, LlmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the active session and build the error event to surface.
    fn fail_session(state: &mut LlmState, code: &str, message: &str) -> Option<LlmEvent> {
        let session = state.session.as_mut()?;
        let request_id = session.request_id().to_owned();
        match session.fail(code, message) {
            Some(StreamUpdate::Error { code, message }) => {
                Some(LlmEvent::Error { request_id: Some(request_id), code, message })
            },
            _ => None,
        }
    }
}

fn event_for(request_id: &str, update: StreamUpdate) -> LlmEvent {
    let request_id = request_id.to_owned();
    match update {
        StreamUpdate::Chunk(content) => LlmEvent::Chunk { request_id, content },
        StreamUpdate::Thinking(content) => LlmEvent::Thinking { request_id, content },
        StreamUpdate::Complete { full_content } => LlmEvent::Complete { request_id, full_content },
        StreamUpdate::Error { code, message } => {
            LlmEvent::Error { request_id: Some(request_id), code, message }
        },
    }
}

impl ModuleHandler for LlmHandler {
    fn module(&self) -> &'static str {
        modules::LLM
    }

    fn handle_envelope(&self, envelope: Envelope) {
        let message: LlmServerMessage = match message_from_envelope(&envelope) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, kind = %envelope.kind, "dropping unrecognized llm message");
                return;
            },
        };

        // Events are computed under the state lock but emitted after it is
        // released, so subscribers may call back into the client.
        let event = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }

            if let LlmServerMessage::Error { code, message } = message {
                // Module-wide failure: terminates whatever stream is live,
                // then surfaces once with no request id.
                let _ = LlmHandler::fail_session(&mut state, &code, &message);
                Some(LlmEvent::Error { request_id: None, code, message })
            } else {
                match (envelope.request_id.as_deref(), state.session.as_mut()) {
                    (Some(request_id), Some(session)) if request_id == session.request_id() => {
                        session.handle(message).map(|update| event_for(request_id, update))
                    },
                    (request_id, _) => {
                        tracing::debug!(?request_id, "discarding stream event for stale request");
                        None
                    },
                }
            }
        };

        if let Some(event) = event {
            self.registry.emit(&event);
        }
    }

    fn handle_link(&self, link: &LinkEvent) {
        let event = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            match link {
                LinkEvent::Lost { reason } => {
                    LlmHandler::fail_session(&mut state, "sidecar_lost", reason)
                },
                LinkEvent::Unavailable => LlmHandler::fail_session(
                    &mut state,
                    "sidecar_unavailable",
                    "restart budget exhausted",
                ),
                LinkEvent::SendDropped { envelope } => {
                    match (envelope.request_id.as_deref(), state.session.as_ref()) {
                        (Some(request_id), Some(session))
                            if request_id == session.request_id() =>
                        {
                            LlmHandler::fail_session(
                                &mut state,
                                "transport_overflow",
                                "command shed by the send queue",
                            )
                        },
                        _ => None,
                    }
                },
                LinkEvent::Restored => None,
            }
        };

        if let Some(event) = event {
            self.registry.emit(&event);
        }
    }
}
