//! Frame server: accepts connections, authenticates, runs channels.
//!
//! One control structure serves both wire profiles; `Protocol` picks
//! whether an accepted socket is wrapped directly (tcp) or upgraded first
//! (ws). Per connection: acceptor with a login deadline, duplicate-id
//! rejection, channel registration, read loop, then teardown with a
//! disconnect notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use skein_core::{wire, OpCode};

use crate::channel::Channel;
use crate::error::Error;
use crate::naming::ServiceRecord;
use crate::registry::ChannelRegistry;
use crate::traits::{Acceptor, MessageListener, Metadata, StateListener};
use crate::transport::{Connection, Protocol, TcpConn, WsConn};

/// Server-side deadlines.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Deadline for the acceptor to read the first frame.
    pub login_wait: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            login_wait: wire::DEFAULT_LOGIN_WAIT,
            read_wait: wire::DEFAULT_READ_WAIT,
            write_wait: wire::DEFAULT_WRITE_WAIT,
        }
    }
}

/// A tcp/ws frame server bound to one listen address.
pub struct Server {
    listen: String,
    protocol: Protocol,
    service: ServiceRecord,
    options: ServerOptions,
    registry: Arc<ChannelRegistry>,
    acceptor: Option<Arc<dyn Acceptor>>,
    message_listener: Option<Arc<dyn MessageListener>>,
    state_listener: Option<Arc<dyn StateListener>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_once: AtomicBool,
}

impl Server {
    #[must_use]
    pub fn new(listen: &str, protocol: Protocol, service: ServiceRecord) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            listen: listen.to_string(),
            protocol,
            service,
            options: ServerOptions::default(),
            registry: Arc::new(ChannelRegistry::new()),
            acceptor: None,
            message_listener: None,
            state_listener: None,
            local_addr: OnceLock::new(),
            shutdown_tx,
            shutdown_once: AtomicBool::new(false),
        }
    }

    pub fn set_acceptor(&mut self, acceptor: Arc<dyn Acceptor>) {
        self.acceptor = Some(acceptor);
    }

    pub fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.message_listener = Some(listener);
    }

    pub fn set_state_listener(&mut self, listener: Arc<dyn StateListener>) {
        self.state_listener = Some(listener);
    }

    pub fn set_read_wait(&mut self, wait: Duration) {
        if !wait.is_zero() {
            self.options.read_wait = wait;
        }
    }

    pub fn set_login_wait(&mut self, wait: Duration) {
        if !wait.is_zero() {
            self.options.login_wait = wait;
        }
    }

    pub fn set_registry(&mut self, registry: Arc<ChannelRegistry>) {
        self.registry = registry;
    }

    #[must_use]
    pub fn service(&self) -> &ServiceRecord {
        &self.service
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service.id
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Bound address, available once `start` has bound the listener.
    /// Binding to port 0 and polling this is how tests pick free ports.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds and runs the accept loop until shutdown.
    ///
    /// # Errors
    ///
    /// Fails when a state listener or message listener is missing, or when
    /// the bind itself fails. Per-connection errors are logged, not
    /// returned.
    pub async fn start(self: Arc<Self>) -> Result<(), Error> {
        let state_listener = self
            .state_listener
            .clone()
            .ok_or(Error::StateListenerMissing)?;
        let message_listener = self
            .message_listener
            .clone()
            .ok_or(Error::MessageListenerMissing)?;
        let acceptor = self
            .acceptor
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultAcceptor));

        let listener = TcpListener::bind(&self.listen).await?;
        let _ = self.local_addr.set(listener.local_addr()?);
        info!(
            module = "server",
            listen = %self.listen,
            id = %self.service.id,
            protocol = self.protocol.as_str(),
            "server started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!(module = "server", id = %self.service.id, "accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(module = "server", "accept failed: {err}");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let acceptor = Arc::clone(&acceptor);
                    let message_listener = Arc::clone(&message_listener);
                    let state_listener = Arc::clone(&state_listener);
                    tokio::spawn(async move {
                        server
                            .handle_connection(stream, acceptor, message_listener, state_listener)
                            .await;
                    });
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        acceptor: Arc<dyn Acceptor>,
        message_listener: Arc<dyn MessageListener>,
        state_listener: Arc<dyn StateListener>,
    ) {
        let mut conn = match self.protocol {
            Protocol::Tcp => Connection::Tcp(TcpConn::new(stream)),
            Protocol::Ws => match WsConn::accept(stream).await {
                Ok(conn) => Connection::Ws(conn),
                Err(err) => {
                    warn!(module = "server", "ws upgrade failed: {err}");
                    return;
                }
            },
        };

        let (id, metadata) = match acceptor.accept(&mut conn, self.options.login_wait).await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(module = "server", "acceptor rejected connection: {err}");
                let _ = conn
                    .write_frame(OpCode::Close, err.to_string().into_bytes())
                    .await;
                let _ = conn.flush().await;
                return;
            }
        };

        if self.registry.get(&id).is_some() {
            warn!(module = "server", id = %id, "channel existed");
            let reason = Error::DuplicateChannel { id }.to_string();
            let _ = conn.write_frame(OpCode::Close, reason.into_bytes()).await;
            let _ = conn.flush().await;
            return;
        }

        let channel = Channel::new(id, metadata, conn);
        channel.set_read_wait(self.options.read_wait);
        channel.set_write_wait(self.options.write_wait);
        self.registry.add(Arc::clone(&channel));
        info!(module = "server", id = %channel.id(), "accepted channel");

        if let Err(err) = channel.read_message(message_listener).await {
            debug!(module = "server", id = %channel.id(), "read loop ended: {err}");
        }

        self.registry.remove(channel.id());
        if let Err(err) = state_listener.disconnect(channel.id()).await {
            warn!(module = "server", id = %channel.id(), "disconnect listener failed: {err}");
        }
        let _ = channel.close();
    }

    /// Pushes one payload to the channel registered under `id`.
    ///
    /// # Errors
    ///
    /// `Error::ChannelNotFound` when the id is absent; channel push errors
    /// otherwise.
    pub async fn push(&self, id: &str, payload: Vec<u8>) -> Result<(), Error> {
        match self.registry.get(id) {
            Some(channel) => channel.push(payload).await,
            None => Err(Error::ChannelNotFound { id: id.to_string() }),
        }
    }

    /// Stops the accept loop and closes every channel, checking the
    /// deadline between closes so shutdown duration stays bounded.
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        if self.shutdown_once.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(module = "server", id = %self.service.id, "shutdown");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + timeout;
        for channel in self.registry.all() {
            let _ = channel.close();
            if Instant::now() >= deadline {
                warn!(module = "server", "shutdown deadline hit, abandoning remaining channels");
                break;
            }
        }
        Ok(())
    }
}

/// Fallback acceptor: assigns a random unique id with no authentication.
pub struct DefaultAcceptor;

#[async_trait]
impl Acceptor for DefaultAcceptor {
    async fn accept(
        &self,
        _conn: &mut Connection,
        _login_wait: Duration,
    ) -> Result<(String, Metadata), Error> {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        Ok((id, Metadata::new()))
    }
}

#[cfg(test)]
mod tests {
    use skein_core::Frame;

    use super::*;

    struct EchoListener;

    #[async_trait]
    impl MessageListener for EchoListener {
        async fn receive(&self, agent: Arc<dyn crate::traits::Agent>, payload: Vec<u8>) {
            let _ = agent.push(payload).await;
        }
    }

    struct NullStateListener;

    #[async_trait]
    impl StateListener for NullStateListener {
        async fn disconnect(&self, _channel_id: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Acceptor that hands out a fixed id, for duplicate-id tests.
    struct FixedIdAcceptor(&'static str);

    #[async_trait]
    impl Acceptor for FixedIdAcceptor {
        async fn accept(
            &self,
            _conn: &mut Connection,
            _login_wait: Duration,
        ) -> Result<(String, Metadata), Error> {
            Ok((self.0.to_string(), Metadata::new()))
        }
    }

    async fn start_server(acceptor: Option<Arc<dyn Acceptor>>) -> (Arc<Server>, SocketAddr) {
        let service = ServiceRecord::new("srv01", "test", "tcp", "", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Tcp, service);
        if let Some(acceptor) = acceptor {
            server.set_acceptor(acceptor);
        }
        server.set_message_listener(Arc::new(EchoListener));
        server.set_state_listener(Arc::new(NullStateListener));
        let server = Arc::new(server);

        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.start().await;
        });

        let addr = wait_for_addr(&server).await;
        (server, addr)
    }

    async fn wait_for_addr(server: &Arc<Server>) -> SocketAddr {
        for _ in 0..100 {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never bound");
    }

    async fn connect(addr: SocketAddr) -> Connection {
        let stream = TcpStream::connect(addr).await.unwrap();
        Connection::Tcp(TcpConn::new(stream))
    }

    #[tokio::test]
    async fn start_requires_listeners() {
        let service = ServiceRecord::new("srv01", "test", "tcp", "", 0);
        let server = Arc::new(Server::new("127.0.0.1:0", Protocol::Tcp, service));
        assert!(matches!(
            server.start().await,
            Err(Error::MessageListenerMissing | Error::StateListenerMissing)
        ));
    }

    #[tokio::test]
    async fn echo_through_registered_channel() {
        let (server, addr) = start_server(None).await;

        let mut client = connect(addr).await;
        client
            .write_frame(OpCode::Binary, b"ping-payload".to_vec())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::binary(b"ping-payload".to_vec()));
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn push_to_unknown_channel_fails() {
        let (server, _addr) = start_server(None).await;
        assert!(matches!(
            server.push("missing", b"x".to_vec()).await,
            Err(Error::ChannelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_id_rejected_with_close_reason() {
        let (server, addr) = start_server(Some(Arc::new(FixedIdAcceptor("dup")))).await;

        let mut first = connect(addr).await;
        // Keep the first connection alive; wait until it is registered.
        for _ in 0..100 {
            if server.registry().get("dup").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.registry().get("dup").is_some());

        let mut second = connect(addr).await;
        let frame = tokio::time::timeout(Duration::from_secs(2), second.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(frame.payload, b"channelId is repeated");

        // The first channel stays registered and usable.
        assert!(server.registry().get("dup").is_some());
        server.push("dup", b"still here".to_vec()).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), first.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, b"still here");
    }

    #[tokio::test]
    async fn shutdown_closes_channels_and_is_idempotent() {
        let (server, addr) = start_server(None).await;

        let _client = connect(addr).await;
        for _ in 0..100 {
            if server.registry().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        server.shutdown(Duration::from_secs(1)).await.unwrap();

        // New connections are no longer accepted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = TcpStream::connect(addr).await;
        if let Ok(stream) = result {
            // The listener socket is gone; at best the connect lands on a
            // dead socket whose read returns EOF/err promptly.
            let mut conn = Connection::Tcp(TcpConn::new(stream));
            let read = tokio::time::timeout(Duration::from_millis(500), conn.read_frame()).await;
            assert!(!matches!(read, Ok(Ok(_))));
        }
    }
}
