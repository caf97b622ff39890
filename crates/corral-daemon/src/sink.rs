//! Frame write multiplexer.
//!
//! Many producers write to one client socket: the runner's stdout and
//! stderr forwarders, the session's control frames, the version lister.
//! [`FrameSink`] serializes them with a double-buffer: frames accumulate
//! in a back queue while at most one gathered write is in flight, and
//! each producer's `send` resolves once the batch containing its frame
//! has been written.
//!
//! # Invariants
//!
//! - At most one socket write is outstanding at any time.
//! - Frames appear on the wire in `send` order.
//! - Every `send` resolves exactly once, after its batch is written.
//! - A failed write turns the sink dead: pending and future sends
//!   resolve immediately and their frames are discarded, so producers
//!   draining a child are never wedged on a vanished peer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corral_core::protocol::encode_frame_into;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable handle serializing concurrent frame producers onto one
/// socket.
#[derive(Clone)]
pub struct FrameSink {
    state: Arc<Mutex<SinkState>>,
}

struct SinkState {
    writer: WriterSlot,
    back: Vec<PendingFrame>,
}

enum WriterSlot {
    /// Writer is parked here between flushes.
    Idle(BoxedWriter),
    /// A flush task has the writer checked out.
    Busy,
    /// The socket failed; frames are discarded from now on.
    Dead,
}

struct PendingFrame {
    bytes: Vec<u8>,
    done: oneshot::Sender<()>,
}

impl FrameSink {
    /// Creates a sink owning the write half of a client socket.
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                writer: WriterSlot::Idle(Box::new(writer)),
                back: Vec::new(),
            })),
        }
    }

    /// Enqueues one frame and waits until its batch has been written.
    ///
    /// The await is the protocol's backpressure: a forwarder does not
    /// read the next chunk from a child pipe until the previous chunk
    /// has reached the socket. On a dead sink this returns immediately.
    pub async fn send(&self, command: &str, payload: &[u8]) {
        let rx = {
            let mut state = self.lock_state();
            if matches!(state.writer, WriterSlot::Dead) {
                return;
            }

            let mut bytes = Vec::new();
            encode_frame_into(&mut bytes, command, payload);
            let (tx, rx) = oneshot::channel();
            state.back.push(PendingFrame { bytes, done: tx });

            if let WriterSlot::Idle(writer) =
                std::mem::replace(&mut state.writer, WriterSlot::Busy)
            {
                tokio::spawn(self.clone().flush_loop(writer));
            }
            rx
        };
        let _ = rx.await;
    }

    /// Drains batches until the back queue is empty, then parks the
    /// writer again. Runs as its own task so `send` never blocks on I/O
    /// while holding the queue lock.
    async fn flush_loop(self, mut writer: BoxedWriter) {
        loop {
            let batch = {
                let mut state = self.lock_state();
                if state.back.is_empty() {
                    state.writer = WriterSlot::Idle(writer);
                    return;
                }
                std::mem::take(&mut state.back)
            };

            let mut wire = Vec::with_capacity(batch.iter().map(|f| f.bytes.len()).sum());
            for frame in &batch {
                wire.extend_from_slice(&frame.bytes);
            }

            let result = async {
                writer.write_all(&wire).await?;
                writer.flush().await
            }
            .await;

            match result {
                Ok(()) => {
                    for frame in batch {
                        let _ = frame.done.send(());
                    }
                },
                Err(error) => {
                    debug!(%error, "socket write failed; discarding further output");
                    for frame in batch {
                        let _ = frame.done.send(());
                    }
                    let mut state = self.lock_state();
                    state.writer = WriterSlot::Dead;
                    for frame in state.back.drain(..) {
                        let _ = frame.done.send(());
                    }
                    return;
                },
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
