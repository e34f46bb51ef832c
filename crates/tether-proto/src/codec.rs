//! Streaming frame codec.
//!
//! [`encode_envelope`] produces one contiguous buffer per frame so the
//! transport can hand it to a single write and frames never interleave on
//! the wire. [`FrameDecoder`] does the reverse: it accumulates an arbitrary
//! byte stream and yields complete envelopes, surviving malformed input by
//! resynchronizing on the next magic marker.

use bytes::{Bytes, BytesMut};

use crate::{
    Envelope, Frame, FrameHeader,
    errors::Result,
};

/// Encode an envelope into a single wire buffer (header + JSON body).
///
/// # Errors
///
/// - [`ProtocolError::Envelope`] if the envelope fails to serialize
/// - [`ProtocolError::PayloadTooLarge`] if the body exceeds the frame limit
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes> {
    let body = envelope.to_json()?;

    let frame = Frame::new(FrameHeader::new(), body);
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + frame.payload.len());
    frame.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Incremental decoder for the incoming byte stream.
///
/// Feed bytes with [`FrameDecoder::extend`], drain envelopes with
/// [`FrameDecoder::next_envelope`]. Malformed input is dropped and logged as
/// a protocol error, never returned: the reader loop has no failure mode
/// short of the channel closing.
///
/// # Resynchronization
///
/// A corrupt header makes the length prefix untrustworthy, so the decoder
/// discards bytes up to the next occurrence of [`FrameHeader::MAGIC`] and
/// resumes there. A frame whose header is valid but whose JSON body is
/// malformed consumes exactly its declared length, leaving the stream
/// aligned without a scan.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Malformed frames dropped since construction.
    dropped: u64,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of malformed frames dropped so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes buffered but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete envelope, if any.
    ///
    /// Returns `None` when the buffer holds no complete frame; call again
    /// after the next [`FrameDecoder::extend`]. Malformed frames are
    /// skipped internally.
    pub fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            if self.buf.len() < FrameHeader::SIZE {
                return None;
            }

            let header = match FrameHeader::from_bytes(&self.buf) {
                Ok(header) => header,
                Err(error) => {
                    debug_assert!(error.needs_resync(), "length was checked before parsing");
                    tracing::warn!(%error, "dropping malformed frame header, resynchronizing");
                    self.dropped += 1;
                    self.resync();
                    continue;
                },
            };

            let total_size = FrameHeader::SIZE + header.payload_size() as usize;
            if self.buf.len() < total_size {
                // Partial frame; wait for more bytes.
                return None;
            }

            let frame_bytes = self.buf.split_to(total_size);
            match Envelope::from_json(&frame_bytes[FrameHeader::SIZE..]) {
                Ok(envelope) => return Some(envelope),
                Err(error) => {
                    // Frame-aligned failure: the length prefix was honest,
                    // so the next frame starts right after this one.
                    tracing::warn!(%error, "dropping frame with malformed envelope body");
                    self.dropped += 1;
                },
            }
        }
    }

    /// Discard bytes up to the next magic marker.
    ///
    /// Skips at least one byte so a corrupt frame that begins with a valid
    /// marker cannot loop forever. Keeps a 3-byte tail when no marker is
    /// found, in case a marker straddles the chunk boundary.
    fn resync(&mut self) {
        let magic = FrameHeader::MAGIC.to_be_bytes();

        let next = self.buf[1..].windows(magic.len()).position(|window| window == magic);

        match next {
            Some(offset) => {
                self.buf.advance_drop(offset + 1);
            },
            None => {
                let keep = (magic.len() - 1).min(self.buf.len());
                self.buf.advance_drop(self.buf.len() - keep);
            },
        }
    }
}

/// Small extension to spell out intent at call sites.
trait AdvanceDrop {
    fn advance_drop(&mut self, count: usize);
}

impl AdvanceDrop for BytesMut {
    fn advance_drop(&mut self, count: usize) {
        let _ = self.split_to(count);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::envelope::modules;

    fn chunk_envelope(content: &str) -> Envelope {
        Envelope {
            module: modules::LLM.to_owned(),
            kind: "stream_chunk".to_owned(),
            request_id: Some("req-1".to_owned()),
            payload: serde_json::json!({ "content": content }),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let envelope = chunk_envelope("He");
        let wire = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);

        assert_eq!(decoder.next_envelope(), Some(envelope));
        assert_eq!(decoder.next_envelope(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decode_across_split_delivery() {
        let envelope = chunk_envelope("llo");
        let wire = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        // One byte at a time: worst-case fragmentation.
        for byte in wire.iter() {
            decoder.extend(std::slice::from_ref(byte));
        }
        assert_eq!(decoder.next_envelope(), Some(envelope));
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let first = chunk_envelope("He");
        let second = chunk_envelope("llo");

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_envelope(&first).unwrap());
        stream.extend_from_slice(b"\xFF\xFE garbage bytes \x00\x01");
        stream.extend_from_slice(&encode_envelope(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.next_envelope(), Some(first));
        assert_eq!(decoder.next_envelope(), Some(second));
        assert_eq!(decoder.next_envelope(), None);
        assert!(decoder.dropped() >= 1);
    }

    #[test]
    fn truncated_envelope_between_valid_frames() {
        let first = chunk_envelope("He");
        let second = chunk_envelope("llo");

        // A frame whose header is honest but whose body is cut-off JSON.
        let truncated_body = b"{\"module\":\"llm\",\"type\":";
        let truncated = Frame::new(FrameHeader::new(), truncated_body.to_vec());
        let mut truncated_wire = Vec::new();
        truncated.encode(&mut truncated_wire).unwrap();

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_envelope(&first).unwrap());
        stream.extend_from_slice(&truncated_wire);
        stream.extend_from_slice(&encode_envelope(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.next_envelope(), Some(first));
        assert_eq!(decoder.next_envelope(), Some(second));
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn oversized_length_prefix_recovers() {
        let mut header = FrameHeader::new();
        header.set_payload_size(FrameHeader::MAX_PAYLOAD_SIZE + 1);

        let valid = chunk_envelope("ok");

        let mut stream = Vec::new();
        stream.extend_from_slice(&header.to_bytes());
        stream.extend_from_slice(&encode_envelope(&valid).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream);

        assert_eq!(decoder.next_envelope(), Some(valid));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let envelope = chunk_envelope("He");
        let wire = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire[..wire.len() - 3]);
        assert_eq!(decoder.next_envelope(), None);
        assert_eq!(decoder.dropped(), 0);

        decoder.extend(&wire[wire.len() - 3..]);
        assert_eq!(decoder.next_envelope(), Some(envelope));
    }

    #[test]
    fn empty_payload_envelope() {
        let envelope = Envelope {
            module: modules::SYSTEM.to_owned(),
            kind: "ready".to_owned(),
            request_id: None,
            payload: Value::Null,
        };
        let wire = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        assert_eq!(decoder.next_envelope(), Some(envelope));
    }
}
