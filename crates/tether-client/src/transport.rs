//! Framed transport over the sidecar's stdio.
//!
//! Two spawned tasks bridge the child process pipes to channels: the writer
//! drains a bounded send queue and puts each frame on the wire with a single
//! write, the reader feeds raw bytes through the frame decoder and forwards
//! envelopes upstream. The supervisor owns the event stream; module code
//! only ever sees the [`Transport`] handle.
//!
//! # Backpressure
//!
//! The send queue is bounded and sheds load oldest-first: when a send would
//! exceed the limit the queue keeps the new envelope and drops the one at
//! the front, surfacing [`TransportEvent::Overflow`] so the affected module
//! can fail loudly instead of stalling the UI thread behind a dead pipe.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tether_proto::{Envelope, FrameDecoder, encode_envelope};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use crate::error::SendError;

/// Tuning knobs for one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum envelopes waiting to be written before oldest-first shedding.
    pub send_queue_limit: usize,
}

impl TransportConfig {
    /// Default bound on the send queue.
    pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 256;
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { send_queue_limit: Self::DEFAULT_SEND_QUEUE_LIMIT }
    }
}

/// What the transport reports upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete envelope arrived from the sidecar.
    Envelope(Envelope),

    /// The send queue shed its oldest envelope.
    Overflow {
        /// The envelope that was shed, for routing the failure back to the
        /// module that queued it.
        envelope: Box<Envelope>,
        /// Total envelopes shed since this transport started.
        dropped: u64,
    },

    /// The pipe closed (EOF or write failure). Emitted at most once; a
    /// deliberate [`Transport::shutdown`] suppresses it.
    Closed,
}

struct Shared {
    queue: Mutex<VecDeque<Envelope>>,
    queue_limit: usize,
    wakeup: Notify,
    closed: AtomicBool,
    shed: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed, emitting [`TransportEvent::Closed`] on the first call.
    fn close(&self, emit: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) && emit {
            let _ = self.events.send(TransportEvent::Closed);
        }
        // Unpark the writer so it observes the flag and exits.
        self.wakeup.notify_one();
    }
}

/// Handle for writing to a live sidecar pipe.
///
/// Cheap to clone; all clones feed the same queue and tasks.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    tasks: Arc<[JoinHandle<()>; 2]>,
}

impl Transport {
    /// Bridge `reader`/`writer` (the child's stdout/stdin) to channels.
    ///
    /// Returns the write handle and the event stream. Both I/O tasks run
    /// until EOF, a write failure, or [`Transport::shutdown`].
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            queue_limit: config.send_queue_limit.max(1),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            shed: AtomicU64::new(0),
            events: events_tx,
        });

        let writer_task = tokio::spawn(write_loop(Arc::clone(&shared), writer));
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        (Self { shared, tasks: Arc::new([writer_task, reader_task]) }, events_rx)
    }

    /// Queue an envelope for the sidecar.
    ///
    /// Never blocks. If the queue is at its bound, the oldest queued
    /// envelope is shed and [`TransportEvent::Overflow`] is reported.
    ///
    /// # Errors
    ///
    /// [`SendError::NotConnected`] once the pipe has closed or the
    /// transport was shut down.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SendError::NotConnected);
        }

        let shed = {
            let mut queue = self.shared.lock_queue();
            queue.push_back(envelope);
            if queue.len() > self.shared.queue_limit {
                queue.pop_front().map(|oldest| {
                    (oldest, self.shared.shed.fetch_add(1, Ordering::SeqCst) + 1)
                })
            } else {
                None
            }
        };

        if let Some((oldest, dropped)) = shed {
            tracing::warn!(dropped, module = %oldest.module, "send queue full, shedding oldest envelope");
            let _ = self
                .shared
                .events
                .send(TransportEvent::Overflow { envelope: Box::new(oldest), dropped });
        }

        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// True once the pipe has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Total envelopes shed by the bounded queue.
    #[must_use]
    pub fn shed_count(&self) -> u64 {
        self.shared.shed.load(Ordering::SeqCst)
    }

    /// Stop both I/O tasks without emitting [`TransportEvent::Closed`].
    ///
    /// Dropping the writer closes the child's stdin, which is the sidecar's
    /// signal to exit on its own.
    pub fn shutdown(&self) {
        self.shared.close(false);
        for task in self.tasks.iter() {
            task.abort();
        }
    }
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let envelope = loop {
            if let Some(envelope) = shared.lock_queue().pop_front() {
                break envelope;
            }
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            shared.wakeup.notified().await;
        };

        let wire = match encode_envelope(&envelope) {
            Ok(wire) => wire,
            Err(error) => {
                // Unencodable envelopes are a caller bug; drop rather than
                // kill the pipe for everyone else.
                tracing::error!(%error, module = %envelope.module, "dropping unencodable envelope");
                continue;
            },
        };

        // One write per frame keeps frames contiguous on the wire.
        if writer.write_all(&wire).await.is_err() || writer.flush().await.is_err() {
            shared.close(true);
            return;
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                shared.close(true);
                return;
            },
            Ok(count) => {
                decoder.extend(&buf[..count]);
                while let Some(envelope) = decoder.next_envelope() {
                    if shared.events.send(TransportEvent::Envelope(envelope)).is_err() {
                        // Receiver gone; nothing left to deliver to.
                        shared.close(false);
                        return;
                    }
                }
            },
        }
    }
}
