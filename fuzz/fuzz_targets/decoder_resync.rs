//! Fuzz target for FrameDecoder resynchronization
//!
//! A corrupted byte stream must never crash the decoder, and a valid frame
//! appended after arbitrary garbage must always become decodable once
//! enough bytes arrive (either immediately or after the garbage drains).
//!
//! # Strategy
//!
//! - Garbage prefix: empty, no-magic, embedded magic, spoofed headers
//! - Fragmentation: the stream is fed in arbitrary chunk sizes
//! - Valid frames: interleaved between garbage runs
//!
//! # Invariants
//!
//! - The decoder NEVER panics on any input
//! - `buffered()` never exceeds garbage + appended frame bytes
//! - Decoding valid frames with no garbage never increments `dropped()`

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_proto::{Envelope, FrameDecoder, encode_envelope};

#[derive(Debug, Arbitrary)]
struct ResyncInput {
    garbage: Vec<u8>,
    chunk_size: u8,
    module: ModuleName,
    kind: Vec<u8>,
    request_id: Option<u16>,
}

#[derive(Debug, Arbitrary)]
enum ModuleName {
    Llm,
    Terminal,
    System,
}

fuzz_target!(|input: ResyncInput| {
    let module = match input.module {
        ModuleName::Llm => "llm",
        ModuleName::Terminal => "terminal",
        ModuleName::System => "system",
    };
    let kind: String = input.kind.iter().map(|byte| char::from(b'a' + byte % 26)).collect();
    let envelope = Envelope {
        module: module.to_owned(),
        kind: if kind.is_empty() { "ready".to_owned() } else { kind },
        request_id: input.request_id.map(|id| format!("req-{id}")),
        payload: serde_json::Value::Null,
    };

    let mut stream = input.garbage.clone();
    let wire = encode_envelope(&envelope).expect("well-formed envelope encodes");
    stream.extend_from_slice(&wire);
    stream.extend_from_slice(&wire);

    let chunk_size = usize::from(input.chunk_size).max(1);
    let mut decoder = FrameDecoder::new();
    let mut decoded = Vec::new();
    for chunk in stream.chunks(chunk_size) {
        decoder.extend(chunk);
        while let Some(found) = decoder.next_envelope() {
            decoded.push(found);
        }
    }

    // Recovery: the frame decodes, or a spoofed header in the garbage
    // claimed bytes that are still pending in the buffer.
    assert!(decoded.contains(&envelope) || decoder.buffered() > 0);
    assert!(decoder.buffered() <= stream.len());

    if input.garbage.is_empty() {
        assert_eq!(decoded, vec![envelope.clone(), envelope]);
        assert_eq!(decoder.dropped(), 0);
    }
});
