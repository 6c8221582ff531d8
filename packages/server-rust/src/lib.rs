//! Skein server — gateway/edge runtime and service container.
//!
//! Terminates long-lived client connections over TCP or WebSocket, indexes
//! them in a channel registry, and multiplexes traffic across a dynamic
//! fleet of stateless logic services discovered through an abstract naming
//! interface. Inbound envelopes are either answered in place (heartbeats),
//! pushed back to an owned channel, or forwarded to a peer service chosen
//! by consistent-hash selection.

pub mod channel;
pub mod client;
pub mod container;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod lifecycle;
pub mod logger;
pub mod naming;
pub mod registry;
pub mod server;
pub mod traits;
pub mod transport;

pub use channel::Channel;
pub use client::{ClientOptions, PeerClient};
pub use container::{
    Container, ContainerDispatcher, HashSelector, Selector, ServiceState,
};
pub use error::Error;
pub use gateway::Handler;
pub use handshake::{PeerAcceptor, PeerDialer};
pub use lifecycle::{StateCell, StateError};
pub use naming::{MemoryNaming, Naming, ServiceRecord};
pub use registry::ChannelRegistry;
pub use server::{Server, ServerOptions};
pub use traits::{
    AccessToken, Acceptor, Agent, DialContext, Dialer, Dispatcher, MessageListener, Metadata,
    StateListener, TokenVerifier,
};
pub use transport::{Connection, Protocol};

/// End-to-end scenarios over loopback sockets: login, dispatch, fan-out,
/// selection, and warm-up, with shortened deadlines.
#[cfg(test)]
mod integration_tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    use skein_core::proto::{LoginReq, Session};
    use skein_core::{wire, BasicPkt, LogicPkt, OpCode, Packet, Status, CODE_PONG};

    use crate::container::{hash_code, Container, ServiceState};
    use crate::error::Error;
    use crate::gateway::Handler;
    use crate::handshake::{PeerAcceptor, PeerDialer};
    use crate::naming::{MemoryNaming, Naming, ServiceRecord};
    use crate::server::Server;
    use crate::traits::{
        AccessToken, Acceptor, Agent, MessageListener, Metadata, StateListener, TokenVerifier,
    };
    use crate::transport::{Connection, Protocol, TcpConn};

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    /// Token format `account:app`; anything else is unauthorized.
    struct PlainTokens;

    impl TokenVerifier for PlainTokens {
        fn parse(&self, token: &str) -> Result<AccessToken, Error> {
            match token.split_once(':') {
                Some((account, app)) if !account.is_empty() => Ok(AccessToken {
                    account: account.to_string(),
                    app: app.to_string(),
                }),
                _ => Err(Error::Unauthorized {
                    reason: "invalid token".to_string(),
                }),
            }
        }
    }

    struct NullStateListener;

    #[async_trait]
    impl StateListener for NullStateListener {
        async fn disconnect(&self, _channel_id: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    struct NullListener;

    #[async_trait]
    impl MessageListener for NullListener {
        async fn receive(&self, _agent: Arc<dyn Agent>, _payload: Vec<u8>) {}
    }

    /// Login-tier fixture: answers `login.signin` with a Success envelope
    /// pushed back through the gateway that forwarded it.
    struct LoginService {
        container: Arc<Container>,
    }

    #[async_trait]
    impl MessageListener for LoginService {
        async fn receive(&self, _agent: Arc<dyn Agent>, payload: Vec<u8>) {
            let Ok(packet) = LogicPkt::must_read(&payload) else {
                return;
            };
            if packet.header.command != wire::COMMAND_LOGIN_SIGNIN {
                return;
            }
            let Ok(session) = packet.read_body::<Session>() else {
                return;
            };
            let Some(gateway) = packet.get_meta(wire::META_DEST_SERVER).map(str::to_string)
            else {
                return;
            };

            // Give the gateway a moment to register the channel, the way a
            // real logic tier would never answer in microseconds.
            sleep(Duration::from_millis(100)).await;

            let mut resp = LogicPkt::from_header(&packet.header).with_status(Status::Success);
            resp.add_meta(wire::META_DEST_CHANNELS, &session.channel_id);
            if let Err(err) = self.container.push(&gateway, &mut resp).await {
                tracing::error!("login response push failed: {err}");
            }
        }
    }

    /// Chat-tier fixture: records which node received which channel.
    struct RecordingChat {
        node_id: String,
        log: Arc<parking_lot::Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl MessageListener for RecordingChat {
        async fn receive(&self, _agent: Arc<dyn Agent>, payload: Vec<u8>) {
            if let Ok(packet) = LogicPkt::must_read(&payload) {
                self.log
                    .lock()
                    .push((self.node_id.clone(), packet.header.channel_id.clone()));
            }
        }
    }

    /// Acceptor handing out pre-assigned channel ids, one per connection.
    struct QueueAcceptor {
        ids: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acceptor for QueueAcceptor {
        async fn accept(
            &self,
            _conn: &mut Connection,
            _login_wait: Duration,
        ) -> Result<(String, Metadata), Error> {
            let id = self.ids.lock().remove(0);
            Ok((id, Metadata::new()))
        }
    }

    async fn wait_for_addr(server: &Arc<Server>) -> SocketAddr {
        for _ in 0..200 {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("server never bound");
    }

    async fn wait_for_adults(container: &Arc<Container>, name: &str, count: usize) {
        for _ in 0..200 {
            if let Some(map) = container.clients_of(name) {
                if map.services(ServiceState::Adult).len() >= count {
                    return;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("{name}: dependencies never became adult");
    }

    /// Starts a plain logic-tier server (peer handshake acceptor) and
    /// registers it with naming under its bound port.
    async fn start_logic_node(
        naming: &Arc<MemoryNaming>,
        id: &str,
        name: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Arc<Server> {
        let service = ServiceRecord::new(id, name, "tcp", "127.0.0.1", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Tcp, service);
        server.set_acceptor(Arc::new(PeerAcceptor));
        server.set_message_listener(listener);
        server.set_state_listener(Arc::new(NullStateListener));
        let server = Arc::new(server);

        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.start().await;
        });
        let addr = wait_for_addr(&server).await;

        let record = ServiceRecord::new(id, name, "tcp", "127.0.0.1", addr.port());
        naming.register(&record).await.unwrap();
        server
    }

    /// Starts a full login-tier node with its own container so it can push
    /// responses back through the peer link.
    async fn start_login_node(naming: &Arc<MemoryNaming>, id: &str) -> Arc<Container> {
        let container = Arc::new(Container::new());
        let listener = Arc::new(LoginService {
            container: Arc::clone(&container),
        });

        let service = ServiceRecord::new(id, wire::SN_LOGIN, "tcp", "127.0.0.1", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Tcp, service);
        server.set_acceptor(Arc::new(PeerAcceptor));
        server.set_message_listener(listener);
        server.set_state_listener(Arc::new(NullStateListener));
        let server = Arc::new(server);

        container.init(Arc::clone(&server), &[]).unwrap();
        container.set_naming(Arc::clone(naming) as Arc<dyn Naming>);
        container.start().await.unwrap();

        let addr = wait_for_addr(&server).await;
        let record = ServiceRecord::new(id, wire::SN_LOGIN, "tcp", "127.0.0.1", addr.port());
        naming.register(&record).await.unwrap();
        container
    }

    /// Starts a gateway wired to the given dependencies.
    async fn start_gateway(
        naming: &Arc<MemoryNaming>,
        id: &str,
        deps: &[&str],
    ) -> (Arc<Container>, Arc<Server>, SocketAddr) {
        let container = Arc::new(Container::new());
        let handler = Arc::new(Handler::new(
            id,
            Arc::clone(&container),
            Arc::new(PlainTokens),
        ));

        let service = ServiceRecord::new(id, "gateway", "tcp", "", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Tcp, service);
        server.set_acceptor(Arc::clone(&handler) as Arc<dyn Acceptor>);
        server.set_message_listener(Arc::clone(&handler) as Arc<dyn MessageListener>);
        server.set_state_listener(handler as Arc<dyn StateListener>);
        let server = Arc::new(server);

        container.init(Arc::clone(&server), deps).unwrap();
        container.set_naming(Arc::clone(naming) as Arc<dyn Naming>);
        container.set_dialer(Arc::new(PeerDialer::new(id)));
        container.start().await.unwrap();

        let addr = wait_for_addr(&server).await;
        (container, server, addr)
    }

    async fn connect_client(addr: SocketAddr) -> Connection {
        let stream = TcpStream::connect(addr).await.unwrap();
        Connection::Tcp(TcpConn::new(stream))
    }

    async fn send_envelope(conn: &mut Connection, payload: Vec<u8>) {
        conn.write_frame(OpCode::Binary, payload).await.unwrap();
        conn.flush().await.unwrap();
    }

    fn login_pkt(token: &str) -> LogicPkt {
        let mut pkt = LogicPkt::new(wire::COMMAND_LOGIN_SIGNIN);
        pkt.write_body(&LoginReq {
            token: token.to_string(),
        });
        pkt
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn login_happy_path_registers_channel_and_answers_success() {
        let naming = Arc::new(MemoryNaming::new());
        let _login = start_login_node(&naming, "login01").await;
        let (gateway, server, addr) = start_gateway(&naming, "gw1", &[wire::SN_LOGIN]).await;
        wait_for_adults(&gateway, wire::SN_LOGIN, 1).await;

        let mut client = connect_client(addr).await;
        send_envelope(&mut client, login_pkt("alice:skein").marshal()).await;

        // The minted channel id lands in the registry under
        // "<gateway>_<account>_<seq>".
        let mut registered = None;
        for _ in 0..100 {
            if let Some(channel) = server
                .registry()
                .all()
                .into_iter()
                .find(|c| c.id().starts_with("gw1_alice_"))
            {
                registered = Some(channel.id().to_string());
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        let channel_id = registered.expect("login never registered a channel");

        // The login tier answers Success through the push path.
        let frame = timeout(Duration::from_secs(3), client.read_frame())
            .await
            .expect("no login response")
            .unwrap();
        let response = LogicPkt::must_read(&frame.payload).unwrap();
        assert_eq!(response.header.status, Status::Success);
        assert_eq!(response.header.command, wire::COMMAND_LOGIN_SIGNIN);
        assert_eq!(response.header.channel_id, channel_id);
        // Routing meta must not leak to the client.
        assert!(response.get_meta(wire::META_DEST_SERVER).is_none());
        assert!(response.get_meta(wire::META_DEST_CHANNELS).is_none());
    }

    #[tokio::test]
    async fn invalid_first_command_answered_then_closed() {
        let naming = Arc::new(MemoryNaming::new());
        let _login = start_login_node(&naming, "login01").await;
        let (gateway, server, addr) = start_gateway(&naming, "gw1", &[wire::SN_LOGIN]).await;
        wait_for_adults(&gateway, wire::SN_LOGIN, 1).await;

        let mut client = connect_client(addr).await;
        let mut first = LogicPkt::new("chat.talk").with_channel("c-rogue");
        first.write_body(&LoginReq {
            token: "alice:skein".to_string(),
        });
        send_envelope(&mut client, first.marshal()).await;

        let frame = timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap()
            .unwrap();
        let response = LogicPkt::must_read(&frame.payload).unwrap();
        assert_eq!(response.header.status, Status::InvalidCommand);

        let close = timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(close.opcode, OpCode::Close);

        assert_eq!(server.registry().len(), 0, "registry must stay unchanged");
    }

    #[tokio::test]
    async fn invalid_token_answered_with_unauthorized() {
        let naming = Arc::new(MemoryNaming::new());
        let _login = start_login_node(&naming, "login01").await;
        let (gateway, server, addr) = start_gateway(&naming, "gw1", &[wire::SN_LOGIN]).await;
        wait_for_adults(&gateway, wire::SN_LOGIN, 1).await;

        let mut client = connect_client(addr).await;
        send_envelope(&mut client, login_pkt("garbage").marshal()).await;

        let frame = timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap()
            .unwrap();
        let response = LogicPkt::must_read(&frame.payload).unwrap();
        assert_eq!(response.header.status, Status::Unauthorized);

        let close = timeout(Duration::from_secs(2), client.read_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(server.registry().len(), 0);
    }

    #[tokio::test]
    async fn envelope_ping_answered_with_envelope_pong() {
        let naming = Arc::new(MemoryNaming::new());
        let _login = start_login_node(&naming, "login01").await;
        let (gateway, _server, addr) = start_gateway(&naming, "gw1", &[wire::SN_LOGIN]).await;
        wait_for_adults(&gateway, wire::SN_LOGIN, 1).await;

        let mut client = connect_client(addr).await;
        send_envelope(&mut client, login_pkt("alice:skein").marshal()).await;

        send_envelope(&mut client, BasicPkt::ping().marshal()).await;

        // Skip whatever else arrives (the login response) and find the pong.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no envelope pong");
            let Ok(Ok(frame)) = timeout(Duration::from_secs(2), client.read_frame()).await else {
                panic!("connection ended before pong");
            };
            if let Ok(Packet::Basic(basic)) = Packet::read(&frame.payload) {
                assert_eq!(basic.code, CODE_PONG);
                return;
            }
        }
    }

    #[tokio::test]
    async fn forward_is_consistent_per_channel() {
        let naming = Arc::new(MemoryNaming::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for node in ["chat01", "chat02", "chat03"] {
            let listener = Arc::new(RecordingChat {
                node_id: node.to_string(),
                log: Arc::clone(&log),
            });
            start_logic_node(&naming, node, wire::SN_CHAT, listener).await;
        }

        let (gateway, _server, _addr) = start_gateway(&naming, "gw1", &[wire::SN_CHAT]).await;
        wait_for_adults(&gateway, wire::SN_CHAT, 3).await;

        let mut first = LogicPkt::new("chat.talk").with_channel("c1");
        gateway.forward(wire::SN_CHAT, &mut first).await.unwrap();
        let mut second = LogicPkt::new("chat.talk").with_channel("c1");
        gateway.forward(wire::SN_CHAT, &mut second).await.unwrap();

        for _ in 0..100 {
            if log.lock().len() >= 2 {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        let entries = log.lock().clone();
        assert_eq!(entries.len(), 2);

        let nodes = ["chat01", "chat02", "chat03"];
        let expected = nodes[hash_code("c1") as usize % nodes.len()];
        assert_eq!(entries[0].0, expected);
        assert_eq!(entries[1].0, expected);
        assert_eq!(entries[0].1, "c1");
    }

    #[tokio::test]
    async fn push_fans_out_and_skips_missing_channels() {
        let naming = Arc::new(MemoryNaming::new());

        let container = Arc::new(Container::new());
        let service = ServiceRecord::new("gw1", "gateway", "tcp", "", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Tcp, service);
        server.set_acceptor(Arc::new(QueueAcceptor {
            ids: parking_lot::Mutex::new(vec!["c1".to_string(), "c3".to_string()]),
        }));
        server.set_message_listener(Arc::new(NullListener));
        server.set_state_listener(Arc::new(NullStateListener));
        let server = Arc::new(server);

        container.init(Arc::clone(&server), &[]).unwrap();
        container.set_naming(Arc::clone(&naming) as Arc<dyn Naming>);
        container.start().await.unwrap();
        let addr = wait_for_addr(&server).await;

        let mut c1 = connect_client(addr).await;
        for _ in 0..100 {
            if server.registry().get("c1").is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let mut c3 = connect_client(addr).await;
        for _ in 0..100 {
            if server.registry().get("c3").is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        let mut packet = LogicPkt::new("chat.talk").with_channel("c0");
        packet.add_meta(wire::META_DEST_SERVER, "gw1");
        packet.add_meta(wire::META_DEST_CHANNELS, "c1,c2,c3");
        container.push_message(packet).await.unwrap();

        for conn in [&mut c1, &mut c3] {
            let frame = timeout(Duration::from_secs(2), conn.read_frame())
                .await
                .unwrap()
                .unwrap();
            let delivered = LogicPkt::must_read(&frame.payload).unwrap();
            assert_eq!(delivered.header.command, "chat.talk");
            assert!(delivered.get_meta(wire::META_DEST_SERVER).is_none());
            assert!(delivered.get_meta(wire::META_DEST_CHANNELS).is_none());
        }
    }

    #[tokio::test]
    async fn young_services_warm_up_before_selection() {
        let naming = Arc::new(MemoryNaming::new());
        let (gateway, _server, _addr) = start_gateway(&naming, "gw1", &[wire::SN_CHAT]).await;
        gateway.set_warmup(Duration::from_millis(400));

        // Let the subscription install before the node appears.
        sleep(Duration::from_millis(100)).await;
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        start_logic_node(
            &naming,
            "chat01",
            wire::SN_CHAT,
            Arc::new(RecordingChat {
                node_id: "chat01".to_string(),
                log,
            }),
        )
        .await;

        // The node is discovered young: connected but not selectable.
        for _ in 0..100 {
            if gateway
                .clients_of(wire::SN_CHAT)
                .is_some_and(|map| map.contains("chat01"))
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let mut packet = LogicPkt::new("chat.talk").with_channel("c1");
        assert!(matches!(
            gateway.forward(wire::SN_CHAT, &mut packet).await,
            Err(Error::NoServices { .. })
        ));

        // After the warm-up delay it becomes adult and receives traffic.
        wait_for_adults(&gateway, wire::SN_CHAT, 1).await;
        let mut packet = LogicPkt::new("chat.talk").with_channel("c1");
        gateway.forward(wire::SN_CHAT, &mut packet).await.unwrap();
    }

    #[tokio::test]
    async fn websocket_edge_speaks_the_same_envelopes() {
        let naming = Arc::new(MemoryNaming::new());
        let _login = start_login_node(&naming, "login01").await;

        let container = Arc::new(Container::new());
        let handler = Arc::new(Handler::new(
            "gw-ws",
            Arc::clone(&container),
            Arc::new(PlainTokens),
        ));
        let service = ServiceRecord::new("gw-ws", "gateway", "ws", "", 0);
        let mut server = Server::new("127.0.0.1:0", Protocol::Ws, service);
        server.set_acceptor(Arc::clone(&handler) as Arc<dyn Acceptor>);
        server.set_message_listener(Arc::clone(&handler) as Arc<dyn MessageListener>);
        server.set_state_listener(handler as Arc<dyn StateListener>);
        let server = Arc::new(server);

        container.init(Arc::clone(&server), &[wire::SN_LOGIN]).unwrap();
        container.set_naming(Arc::clone(&naming) as Arc<dyn Naming>);
        container.set_dialer(Arc::new(PeerDialer::new("gw-ws")));
        container.start().await.unwrap();
        let addr = wait_for_addr(&server).await;
        wait_for_adults(&container, wire::SN_LOGIN, 1).await;

        let ws = crate::transport::WsConn::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        let mut client = Connection::Ws(ws);
        send_envelope(&mut client, login_pkt("bob:skein").marshal()).await;

        let frame = timeout(Duration::from_secs(3), client.read_frame())
            .await
            .expect("no ws login response")
            .unwrap();
        let response = LogicPkt::must_read(&frame.payload).unwrap();
        assert_eq!(response.header.status, Status::Success);
        assert!(response.header.channel_id.starts_with("gw-ws_bob_"));
    }
}
