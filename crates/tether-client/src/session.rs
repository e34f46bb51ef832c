//! Pure state machine for one inference stream.
//!
//! No I/O and no clocks live here: [`StreamSession`] consumes sidecar
//! messages and yields the updates worth surfacing to subscribers. The LLM
//! client owns the session, does the sending, and emits the updates; this
//! type only decides what a message means given where the stream is.
//!
//! # Invariants
//!
//! - A session leaves [`StreamState::Active`] at most once, and never
//!   re-enters it. Terminal states absorb all further input.
//! - Every chunk accepted while active is accumulated, so a completion
//!   without content can still report the full response text.

use tether_proto::payloads::llm::LlmServerMessage;

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet started.
    Idle,
    /// Start command sent; events for this request are live.
    Active,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with a stream error. Terminal.
    Errored,
    /// Cancelled locally. Terminal: late frames for this request are stale.
    Cancelled,
}

impl StreamState {
    /// True once the session can never produce another update.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// An update a live stream produced for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    /// Partial response text.
    Chunk(String),
    /// Partial reasoning text.
    Thinking(String),
    /// Stream finished; carries the full response text.
    Complete {
        /// Accumulated response, preferred from the sidecar's own total.
        full_content: String,
    },
    /// Stream failed.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

/// State for a single request id's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    request_id: String,
    state: StreamState,
    accumulated: String,
}

impl StreamSession {
    /// Create an idle session bound to `request_id`.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), state: StreamState::Idle, accumulated: String::new() }
    }

    /// The request id events must echo to belong to this session.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Mark the start command as sent; events become live.
    pub fn start(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Active;
        }
    }

    /// Cancel locally. Idempotent; a terminal session stays where it is.
    ///
    /// Returns true if this call performed the cancellation, meaning the
    /// caller should tell the sidecar to tear the stream down.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = StreamState::Cancelled;
        true
    }

    /// Fail the session from outside the stream (sidecar lost, transport
    /// overflow). Returns the error update to surface, or `None` if the
    /// session was already terminal.
    pub fn fail(&mut self, code: &str, message: &str) -> Option<StreamUpdate> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = StreamState::Errored;
        Some(StreamUpdate::Error { code: code.to_owned(), message: message.to_owned() })
    }

    /// Apply one sidecar message addressed to this request id.
    ///
    /// Returns the update to surface, or `None` when the message is stale:
    /// anything arriving outside [`StreamState::Active`] is discarded,
    /// which is how late frames after a cancel or completion disappear.
    pub fn handle(&mut self, message: LlmServerMessage) -> Option<StreamUpdate> {
        if self.state != StreamState::Active {
            tracing::debug!(
                request_id = %self.request_id,
                state = ?self.state,
                "discarding stale stream message"
            );
            return None;
        }

        match message {
            LlmServerMessage::StreamChunk { content } => {
                self.accumulated.push_str(&content);
                Some(StreamUpdate::Chunk(content))
            },
            LlmServerMessage::StreamThinking { content } => Some(StreamUpdate::Thinking(content)),
            LlmServerMessage::StreamComplete { full_content } => {
                self.state = StreamState::Completed;
                // Some providers omit the total; fall back to what we saw.
                let full_content = if full_content.is_empty() {
                    std::mem::take(&mut self.accumulated)
                } else {
                    full_content
                };
                Some(StreamUpdate::Complete { full_content })
            },
            LlmServerMessage::StreamError { code, message } | LlmServerMessage::Error { code, message } => {
                self.state = StreamState::Errored;
                Some(StreamUpdate::Error { code, message })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> LlmServerMessage {
        LlmServerMessage::StreamChunk { content: text.to_owned() }
    }

    #[test]
    fn chunks_then_completion() {
        let mut session = StreamSession::new("req-1");
        session.start();
        assert_eq!(session.state(), StreamState::Active);

        assert_eq!(session.handle(chunk("He")), Some(StreamUpdate::Chunk("He".to_owned())));
        assert_eq!(session.handle(chunk("llo")), Some(StreamUpdate::Chunk("llo".to_owned())));

        let done =
            session.handle(LlmServerMessage::StreamComplete { full_content: "Hello".to_owned() });
        assert_eq!(done, Some(StreamUpdate::Complete { full_content: "Hello".to_owned() }));
        assert_eq!(session.state(), StreamState::Completed);
    }

    #[test]
    fn completion_without_total_uses_accumulated_chunks() {
        let mut session = StreamSession::new("req-1");
        session.start();
        session.handle(chunk("He"));
        session.handle(chunk("llo"));

        let done = session.handle(LlmServerMessage::StreamComplete { full_content: String::new() });
        assert_eq!(done, Some(StreamUpdate::Complete { full_content: "Hello".to_owned() }));
    }

    #[test]
    fn thinking_does_not_accumulate_into_response() {
        let mut session = StreamSession::new("req-1");
        session.start();
        session.handle(LlmServerMessage::StreamThinking { content: "hmm".to_owned() });
        session.handle(chunk("Hi"));

        let done = session.handle(LlmServerMessage::StreamComplete { full_content: String::new() });
        assert_eq!(done, Some(StreamUpdate::Complete { full_content: "Hi".to_owned() }));
    }

    #[test]
    fn events_before_start_are_stale() {
        let mut session = StreamSession::new("req-1");
        assert_eq!(session.handle(chunk("early")), None);
        assert_eq!(session.state(), StreamState::Idle);
    }

    #[test]
    fn cancel_makes_late_frames_stale() {
        let mut session = StreamSession::new("req-1");
        session.start();
        session.handle(chunk("He"));

        assert!(session.cancel());
        assert_eq!(session.state(), StreamState::Cancelled);

        // In-flight frames that raced the cancel are discarded silently.
        assert_eq!(session.handle(chunk("llo")), None);
        assert_eq!(
            session.handle(LlmServerMessage::StreamComplete { full_content: "Hello".to_owned() }),
            None
        );
        assert_eq!(session.state(), StreamState::Cancelled);
    }

    #[test]
    fn cancel_is_idempotent_and_terminal_states_stick() {
        let mut session = StreamSession::new("req-1");
        session.start();
        session.handle(LlmServerMessage::StreamComplete { full_content: "x".to_owned() });

        assert!(!session.cancel(), "completed session is not re-cancelled");
        assert_eq!(session.state(), StreamState::Completed);
    }

    #[test]
    fn stream_error_is_terminal() {
        let mut session = StreamSession::new("req-1");
        session.start();

        let update = session.handle(LlmServerMessage::StreamError {
            code: "rate_limited".to_owned(),
            message: "slow down".to_owned(),
        });
        assert_eq!(
            update,
            Some(StreamUpdate::Error {
                code: "rate_limited".to_owned(),
                message: "slow down".to_owned(),
            })
        );
        assert_eq!(session.state(), StreamState::Errored);
        assert_eq!(session.handle(chunk("late")), None);
    }

    #[test]
    fn module_error_addressed_to_the_stream_is_terminal() {
        // A sidecar may address a module-level error frame at a specific
        // request; the session treats it exactly like a stream error.
        let mut session = StreamSession::new("req-1");
        session.start();

        let update = session.handle(LlmServerMessage::Error {
            code: "internal".to_owned(),
            message: "worker died".to_owned(),
        });
        assert_eq!(
            update,
            Some(StreamUpdate::Error {
                code: "internal".to_owned(),
                message: "worker died".to_owned(),
            })
        );
        assert_eq!(session.state(), StreamState::Errored);
        assert_eq!(session.handle(chunk("late")), None);
    }

    #[test]
    fn fail_surfaces_once() {
        let mut session = StreamSession::new("req-1");
        session.start();

        let first = session.fail("sidecar_lost", "process exited");
        assert!(matches!(first, Some(StreamUpdate::Error { ref code, .. }) if code == "sidecar_lost"));
        assert_eq!(session.fail("sidecar_lost", "process exited"), None);
    }

    #[test]
    fn restart_after_terminal_is_ignored() {
        let mut session = StreamSession::new("req-1");
        session.start();
        session.cancel();
        session.start();
        assert_eq!(session.state(), StreamState::Cancelled);
    }
}
