//! End-to-end stream flow against a fake sidecar on an in-memory pipe.
//!
//! These tests run real frames through the real transport, router, and LLM
//! client; only the process boundary is replaced by a duplex stream. The
//! fake sidecar reads the client's commands off the wire and answers with
//! frames of its own, exactly as the binary would.

use std::{sync::Arc, time::Duration};

use tether_client::{
    LinkEvent, LlmClient, LlmEvent, LlmEventKind, Router, Transport, TransportConfig,
    TransportEvent,
};
use tether_proto::{
    Envelope, FrameDecoder, encode_envelope,
    envelope::{envelope_from_message, modules},
    payloads::llm::{LlmServerMessage, StreamStart},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
    time::timeout,
};

const TICK: Duration = Duration::from_secs(5);

/// The sidecar's end of the pipe.
struct FakeSidecar {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
}

impl FakeSidecar {
    /// Next command envelope the client put on the wire.
    async fn read_command(&mut self) -> Envelope {
        loop {
            if let Some(envelope) = self.decoder.next_envelope() {
                return envelope;
            }
            let mut buf = [0u8; 1024];
            let count = self.reader.read(&mut buf).await.expect("client closed the pipe");
            assert_ne!(count, 0, "client closed the pipe");
            self.decoder.extend(&buf[..count]);
        }
    }

    /// Put one event frame on the wire.
    async fn write_event(&mut self, request_id: &str, message: &LlmServerMessage) {
        let envelope =
            envelope_from_message(modules::LLM, Some(request_id.to_owned()), message).unwrap();
        let wire = encode_envelope(&envelope).unwrap();
        self.writer.write_all(&wire).await.unwrap();
    }

    /// Put raw bytes on the wire, framed or not.
    async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }
}

/// Wire a router and LLM client to a fake sidecar, with the transport event
/// pump a supervisor would normally run.
fn harness() -> (Arc<Router>, LlmClient, FakeSidecar) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (local_reader, local_writer) = tokio::io::split(local);
    let (remote_reader, remote_writer) = tokio::io::split(remote);

    let (transport, mut events) =
        Transport::spawn(local_reader, local_writer, TransportConfig::default());

    let router = Arc::new(Router::new());
    router.set_transport(Some(transport));

    let pump_router = Arc::clone(&router);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Envelope(envelope) => pump_router.dispatch(envelope),
                TransportEvent::Overflow { envelope, dropped } => {
                    pump_router.notify_overflow(envelope, dropped);
                },
                TransportEvent::Closed => {
                    pump_router.set_transport(None);
                    pump_router
                        .broadcast_link(&LinkEvent::Lost { reason: "pipe closed".to_owned() });
                },
            }
        }
    });

    let client = LlmClient::new(Arc::clone(&router));
    let sidecar =
        FakeSidecar { reader: remote_reader, writer: remote_writer, decoder: FrameDecoder::new() };

    (router, client, sidecar)
}

/// Forward all stream events into an awaitable channel.
fn subscribe_all(client: &LlmClient) -> mpsc::UnboundedReceiver<LlmEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in
        [LlmEventKind::Chunk, LlmEventKind::Thinking, LlmEventKind::Complete, LlmEventKind::Error]
    {
        let tx = tx.clone();
        client.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    rx
}

fn params() -> StreamStart {
    StreamStart {
        endpoint: "https://api.example.com/v1/messages".to_owned(),
        headers: std::collections::HashMap::new(),
        body: serde_json::json!({ "prompt": "Hi", "stream": true }),
        api_format: "anthropic-messages".to_owned(),
    }
}

#[tokio::test]
async fn stream_round_trip_over_the_wire() {
    let (_router, client, mut sidecar) = harness();
    let mut events = subscribe_all(&client);

    let request_id = client.start_stream(params()).unwrap();

    // The command arrives framed, with the request id in the envelope.
    let command = timeout(TICK, sidecar.read_command()).await.unwrap();
    assert_eq!(command.module, "llm");
    assert_eq!(command.kind, "stream_start");
    assert_eq!(command.request_id.as_deref(), Some(request_id.as_str()));

    sidecar
        .write_event(&request_id, &LlmServerMessage::StreamChunk { content: "He".to_owned() })
        .await;
    sidecar
        .write_event(&request_id, &LlmServerMessage::StreamChunk { content: "llo".to_owned() })
        .await;
    sidecar
        .write_event(
            &request_id,
            &LlmServerMessage::StreamComplete { full_content: "Hello".to_owned() },
        )
        .await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(timeout(TICK, events.recv()).await.unwrap().unwrap());
    }
    assert_eq!(
        seen,
        vec![
            LlmEvent::Chunk { request_id: request_id.clone(), content: "He".to_owned() },
            LlmEvent::Chunk { request_id: request_id.clone(), content: "llo".to_owned() },
            LlmEvent::Complete { request_id, full_content: "Hello".to_owned() },
        ]
    );
}

#[tokio::test]
async fn cancelled_stream_surfaces_nothing() {
    let (_router, client, mut sidecar) = harness();
    let mut events = subscribe_all(&client);

    let old_id = client.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();
    client.cancel_stream().unwrap();
    let cancel = timeout(TICK, sidecar.read_command()).await.unwrap();
    assert_eq!(cancel.kind, "stream_cancel");

    // The sidecar had frames in flight when the cancel landed.
    sidecar
        .write_event(&old_id, &LlmServerMessage::StreamChunk { content: "late".to_owned() })
        .await;
    sidecar
        .write_event(&old_id, &LlmServerMessage::StreamComplete { full_content: "late".to_owned() })
        .await;

    // A fresh stream acts as the barrier proving the late frames were
    // processed and discarded before its own first event.
    let new_id = client.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();
    sidecar
        .write_event(&new_id, &LlmServerMessage::StreamChunk { content: "fresh".to_owned() })
        .await;

    let first = timeout(TICK, events.recv()).await.unwrap().unwrap();
    assert_eq!(first, LlmEvent::Chunk { request_id: new_id, content: "fresh".to_owned() });
}

#[tokio::test]
async fn malformed_bytes_between_frames_do_not_break_the_stream() {
    let (_router, client, mut sidecar) = harness();
    let mut events = subscribe_all(&client);

    let request_id = client.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();

    sidecar
        .write_event(&request_id, &LlmServerMessage::StreamChunk { content: "He".to_owned() })
        .await;
    // Corruption on the wire: no valid header anywhere in it.
    sidecar.write_raw(b"\xff\xfe\x00\x01 not a frame \x7f\x7f").await;
    sidecar
        .write_event(&request_id, &LlmServerMessage::StreamChunk { content: "llo".to_owned() })
        .await;

    let first = timeout(TICK, events.recv()).await.unwrap().unwrap();
    let second = timeout(TICK, events.recv()).await.unwrap().unwrap();
    assert_eq!(first, LlmEvent::Chunk { request_id: request_id.clone(), content: "He".to_owned() });
    assert_eq!(second, LlmEvent::Chunk { request_id, content: "llo".to_owned() });
}

#[tokio::test]
async fn pipe_loss_fails_the_active_stream() {
    let (_router, client, mut sidecar) = harness();
    let mut events = subscribe_all(&client);

    let request_id = client.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();

    drop(sidecar);

    let event = timeout(TICK, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        LlmEvent::Error {
            request_id: Some(request_id),
            code: "sidecar_lost".to_owned(),
            message: "pipe closed".to_owned(),
        }
    );
    assert!(client.start_stream(params()).is_err(), "gate closed after loss");
}

#[tokio::test]
async fn destroyed_client_ignores_frames_and_a_new_client_takes_over() {
    let (router, client, mut sidecar) = harness();

    let request_id = client.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();
    client.destroy();
    // Destroy implicitly cancels the stream it owned.
    let cancel = timeout(TICK, sidecar.read_command()).await.unwrap();
    assert_eq!(cancel.kind, "stream_cancel");

    // Frames for the dead client fall into the unregistered-module path.
    sidecar
        .write_event(&request_id, &LlmServerMessage::StreamChunk { content: "ghost".to_owned() })
        .await;

    // A replacement client registers and streams normally.
    let replacement = LlmClient::new(Arc::clone(&router));
    let mut events = subscribe_all(&replacement);

    let new_id = replacement.start_stream(params()).unwrap();
    let _ = timeout(TICK, sidecar.read_command()).await.unwrap();
    sidecar
        .write_event(&new_id, &LlmServerMessage::StreamChunk { content: "alive".to_owned() })
        .await;

    let event = timeout(TICK, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, LlmEvent::Chunk { request_id: new_id, content: "alive".to_owned() });
}
