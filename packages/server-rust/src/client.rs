//! Outbound peer link: the local representation of a remote service node.
//!
//! A peer client is one-shot: `connect` succeeds at most once (a failed
//! dial rolls the state back so the next discovery event can retry) and
//! `close` is idempotent. Writes are serialised under a mutex rather than
//! queued — callers serialise or compete fairly; there is no coalescing on
//! this side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{trace, warn};

use skein_core::{wire, Frame, OpCode};

use crate::error::Error;
use crate::lifecycle::StateCell;
use crate::traits::{DialContext, Dialer};
use crate::transport::{ConnReader, ConnWriter};

const STATE_DISCONNECTED: u32 = 0;
const STATE_CONNECTED: u32 = 1;

/// Peer client deadlines and heartbeat cadence.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Transport-level ping cadence; zero disables the heartbeat task.
    pub heartbeat: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: wire::DEFAULT_HEARTBEAT,
            read_wait: wire::DEFAULT_READ_WAIT,
            write_wait: wire::DEFAULT_WRITE_WAIT,
        }
    }
}

/// Outbound dialer + read loop toward one remote service node.
pub struct PeerClient {
    id: String,
    name: String,
    options: ClientOptions,
    state: StateCell,
    dialer: parking_lot::RwLock<Option<Arc<dyn Dialer>>>,
    reader: Mutex<Option<ConnReader>>,
    writer: Mutex<Option<ConnWriter>>,
    closed: AtomicBool,
}

impl PeerClient {
    #[must_use]
    pub fn new(id: &str, name: &str, options: ClientOptions) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            options,
            state: StateCell::new(STATE_DISCONNECTED),
            dialer: parking_lot::RwLock::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    /// Dials and handshakes through the injected dialer.
    ///
    /// # Errors
    ///
    /// `Error::State` on a second connect, `Error::DialerMissing` without a
    /// dialer, and whatever the dialer returns otherwise. On failure the
    /// state rolls back so a retry is possible.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), Error> {
        self.state
            .transition(STATE_DISCONNECTED, STATE_CONNECTED)?;

        match self.dial(addr).await {
            Ok(()) => {
                if !self.options.heartbeat.is_zero() {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.heartbeat_loop().await {
                            warn!(
                                module = "client",
                                id = %client.id,
                                "heartbeat loop stopped: {err}"
                            );
                        }
                    });
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.state.transition(STATE_CONNECTED, STATE_DISCONNECTED);
                Err(err)
            }
        }
    }

    async fn dial(&self, addr: &str) -> Result<(), Error> {
        let dialer = self.dialer.read().clone().ok_or(Error::DialerMissing)?;
        let conn = dialer
            .dial_and_handshake(DialContext {
                id: self.id.clone(),
                name: self.name.clone(),
                address: addr.to_string(),
                timeout: wire::DEFAULT_LOGIN_WAIT,
            })
            .await?;

        let (reader, writer) = conn.split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        Ok(())
    }

    /// Writes one binary frame; concurrent senders serialise on an
    /// internal mutex.
    ///
    /// # Errors
    ///
    /// `Error::ConnectionClosed` when not connected, `Error::Deadline` when
    /// the write deadline expires.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self.state.is(STATE_CONNECTED) {
            return Err(Error::ConnectionClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        write_and_flush(writer, OpCode::Binary, payload, self.options.write_wait).await
    }

    /// Reads one frame, translating a remote `Close` into an error. The
    /// read deadline is armed only when a heartbeat is configured — an
    /// unpinged link has nothing to miss.
    pub async fn read(&self) -> Result<Frame, Error> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let frame = if self.options.heartbeat.is_zero() {
            reader.read_frame().await?
        } else {
            match timeout(self.options.read_wait, reader.read_frame()).await {
                Ok(result) => result?,
                Err(_) => return Err(Error::Deadline { kind: "read" }),
            }
        };

        if frame.opcode == OpCode::Close {
            return Err(Error::RemoteClosed);
        }
        Ok(frame)
    }

    /// Gracefully closes the link: one `Close` frame, then the halves are
    /// dropped. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = write_and_flush(
                &mut writer,
                OpCode::Close,
                Vec::new(),
                self.options.write_wait,
            )
            .await;
        }
        let _ = self.reader.lock().await.take();
        let _ = self.state.transition(STATE_CONNECTED, STATE_DISCONNECTED);
    }

    async fn heartbeat_loop(self: &Arc<Self>) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.options.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            ticker.tick().await;
            if !self.state.is(STATE_CONNECTED) {
                return Ok(());
            }
            self.ping().await?;
        }
    }

    async fn ping(&self) -> Result<(), Error> {
        trace!(module = "client", id = %self.id, "send ping to server");
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        write_and_flush(writer, OpCode::Ping, Vec::new(), self.options.write_wait).await
    }
}

async fn write_and_flush(
    writer: &mut ConnWriter,
    opcode: OpCode,
    payload: Vec<u8>,
    write_wait: Duration,
) -> Result<(), Error> {
    match timeout(write_wait, async {
        writer.write_frame(opcode, payload).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Deadline { kind: "write" }),
    }
}
