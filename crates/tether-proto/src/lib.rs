//! Wire format for the channel between a UI front-end and its sidecar
//! process.
//!
//! Every message on the wire is a [`Frame`]: a fixed 12-byte binary header
//! (length prefix plus magic marker) followed by a JSON [`Envelope`] that
//! names the target module, the message type, and an optional request id for
//! stream correlation.
//!
//! The split mirrors the two consumers of a frame:
//! - The transport and router only need the header and the envelope's
//!   `module` field to deliver a frame.
//! - Module clients decode the `type`/`payload` pair into the typed
//!   vocabularies under [`payloads`].
//!
//! [`FrameDecoder`] turns an arbitrary byte stream back into envelopes and
//! resynchronizes on the magic marker after malformed input, so one corrupt
//! frame never desynchronizes the frames behind it.

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod header;
pub mod payloads;

pub use codec::{FrameDecoder, encode_envelope};
pub use envelope::{Envelope, envelope_from_message, message_from_envelope, modules};
pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
