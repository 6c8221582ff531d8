//! Per-connection state machine: framing, liveness, ordered writes.
//!
//! A channel owns one split connection and two tasks. The reader task
//! (driven by `read_message`, callable exactly once) decodes frames
//! serially and hands payloads to the listener on fresh tasks so a slow
//! handler never stalls intake. The writer task drains a bounded queue
//! with coalescing: write the head frame, snapshot the current queue
//! depth, write up to that many more back-to-back, then flush once. That
//! amortises syscalls without reordering and bounds the latency of a lone
//! message at one write+flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use skein_core::{wire, Frame, OpCode};

use crate::error::Error;
use crate::lifecycle::StateCell;
use crate::traits::{Agent, MessageListener, Metadata};
use crate::transport::{ConnWriter, Connection};

const STATE_INIT: u32 = 0;
const STATE_STARTED: u32 = 1;
const STATE_CLOSED: u32 = 2;

/// Bounded depth of the per-channel write queue; `push` blocks the caller
/// once this many payloads are in flight.
pub const WRITE_QUEUE_CAP: usize = 5;

/// Read/write deadlines shared with the writer task. Millisecond atomics
/// so the setters stay lock-free and late changes are picked up by the
/// next I/O operation.
#[derive(Debug)]
struct Waits {
    read_ms: AtomicU64,
    write_ms: AtomicU64,
}

impl Waits {
    fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms.load(Ordering::Relaxed))
    }

    fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms.load(Ordering::Relaxed))
    }
}

/// A server-side object owning one live client connection.
pub struct Channel {
    id: String,
    metadata: Metadata,
    state: StateCell,
    waits: Arc<Waits>,
    data_tx: mpsc::Sender<Vec<u8>>,
    ctrl_tx: mpsc::Sender<Frame>,
    close_tx: watch::Sender<bool>,
    reader: parking_lot::Mutex<Option<crate::transport::ConnReader>>,
}

impl Channel {
    /// Wraps a connection and starts its writer task.
    #[must_use]
    pub fn new(id: impl Into<String>, metadata: Metadata, conn: Connection) -> Arc<Self> {
        let id = id.into();
        let (reader, writer) = conn.split();
        let (data_tx, data_rx) = mpsc::channel(WRITE_QUEUE_CAP);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(2);
        let (close_tx, close_rx) = watch::channel(false);

        let waits = Arc::new(Waits {
            read_ms: AtomicU64::new(wire::DEFAULT_READ_WAIT.as_millis() as u64),
            write_ms: AtomicU64::new(wire::DEFAULT_WRITE_WAIT.as_millis() as u64),
        });

        let task_id = id.clone();
        let task_waits = Arc::clone(&waits);
        tokio::spawn(async move {
            if let Err(err) = write_loop(writer, data_rx, ctrl_rx, close_rx, &task_waits).await {
                debug!(module = "channel", id = %task_id, "write loop ended: {err}");
            }
        });

        Arc::new(Self {
            id,
            metadata,
            state: StateCell::new(STATE_INIT),
            waits,
            data_tx,
            ctrl_tx,
            close_tx,
            reader: parking_lot::Mutex::new(Some(reader)),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn set_read_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.waits.read_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn set_write_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.waits.write_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Enqueues one payload for ordered delivery.
    ///
    /// # Errors
    ///
    /// Fails with `Error::ChannelClosed` unless the channel is started and
    /// its writer task is alive. Blocks while the queue is full.
    pub async fn push(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self.state.is(STATE_STARTED) {
            return Err(Error::ChannelClosed {
                id: self.id.clone(),
            });
        }
        self.data_tx
            .send(payload)
            .await
            .map_err(|_| Error::ChannelClosed {
                id: self.id.clone(),
            })
    }

    /// Writes one out-of-band control frame through the writer task,
    /// bypassing the payload queue. The writer flushes control frames
    /// immediately.
    pub async fn write_frame(&self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.ctrl_tx
            .send(Frame::new(opcode, payload))
            .await
            .map_err(|_| Error::ChannelClosed {
                id: self.id.clone(),
            })
    }

    /// Runs the read loop, delivering inbound payloads to `listener`.
    ///
    /// Callable exactly once; the `Init -> Started` transition gates it.
    /// Returns when the peer closes, a read fails, or the read deadline
    /// expires — the caller owns teardown from there.
    ///
    /// # Errors
    ///
    /// `Error::State` on a second call, `Error::RemoteClosed` when the peer
    /// sent a Close frame, `Error::Deadline` on read-deadline expiry, and
    /// any transport error otherwise.
    pub async fn read_message(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), Error> {
        self.state.transition(STATE_INIT, STATE_STARTED)?;

        let Some(mut reader) = self.reader.lock().take() else {
            return Err(Error::ChannelClosed {
                id: self.id.clone(),
            });
        };

        loop {
            let frame = match timeout(self.waits.read(), reader.read_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::Deadline { kind: "read" }),
            };

            match frame.opcode {
                OpCode::Close => return Err(Error::RemoteClosed),
                OpCode::Ping => {
                    trace!(module = "channel", id = %self.id, "recv a ping; resp with a pong");
                    self.write_frame(OpCode::Pong, Vec::new()).await?;
                }
                OpCode::Binary if !frame.payload.is_empty() => {
                    let agent: Arc<dyn Agent> = Arc::clone(self) as Arc<dyn Agent>;
                    let listener = Arc::clone(&listener);
                    tokio::spawn(async move {
                        listener.receive(agent, frame.payload).await;
                    });
                }
                _ => {}
            }
        }
    }

    /// Closes the channel: `Started -> Closed`, then signals the writer
    /// task, which drains what is already queued, flushes, and exits.
    ///
    /// # Errors
    ///
    /// Fails with `Error::State` when the channel never started or is
    /// already closed.
    pub fn close(&self) -> Result<(), Error> {
        self.state.transition(STATE_STARTED, STATE_CLOSED)?;
        let _ = self.close_tx.send(true);
        Ok(())
    }
}

#[async_trait]
impl Agent for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn push(&self, payload: Vec<u8>) -> Result<(), Error> {
        Channel::push(self, payload).await
    }
}

async fn write_loop(
    mut writer: ConnWriter,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut ctrl_rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
    waits: &Waits,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            biased;

            _ = close_rx.changed() => {
                // Drain the already-queued tail so close never drops
                // payloads that were accepted before it.
                while let Ok(payload) = data_rx.try_recv() {
                    write_with_deadline(&mut writer, OpCode::Binary, payload, waits).await?;
                }
                flush_with_deadline(&mut writer, waits).await?;
                return Ok(());
            }

            frame = ctrl_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                write_with_deadline(&mut writer, frame.opcode, frame.payload, waits).await?;
                flush_with_deadline(&mut writer, waits).await?;
            }

            payload = data_rx.recv() => {
                let Some(payload) = payload else { return Ok(()) };
                write_with_deadline(&mut writer, OpCode::Binary, payload, waits).await?;

                // Coalesce: snapshot the depth now and write exactly that
                // many more, so one slow producer cannot starve the flush.
                let depth = data_rx.len();
                for _ in 0..depth {
                    match data_rx.try_recv() {
                        Ok(payload) => {
                            write_with_deadline(&mut writer, OpCode::Binary, payload, waits)
                                .await?;
                        }
                        Err(_) => break,
                    }
                }
                flush_with_deadline(&mut writer, waits).await?;
            }
        }
    }
}

async fn write_with_deadline(
    writer: &mut ConnWriter,
    opcode: OpCode,
    payload: Vec<u8>,
    waits: &Waits,
) -> Result<(), Error> {
    match timeout(waits.write(), writer.write_frame(opcode, payload)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Deadline { kind: "write" }),
    }
}

async fn flush_with_deadline(writer: &mut ConnWriter, waits: &Waits) -> Result<(), Error> {
    match timeout(waits.write(), writer.flush()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Deadline { kind: "flush" }),
    }
}
