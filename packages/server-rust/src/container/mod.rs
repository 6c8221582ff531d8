//! Service container: lifecycle controller and forwarding plane.
//!
//! The container starts the local server, subscribes the naming service
//! for each declared dependency, builds peer clients on discovery events,
//! and exposes `forward` (send to a peer service chosen by consistent
//! hash) and `push` (deliver to a channel on a gateway) to handlers. One
//! container per process in production; tests instantiate as many as they
//! like.

pub mod clients;
pub mod selector;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use skein_core::{wire, LogicPkt, OpCode};

use crate::client::{ClientOptions, PeerClient};
use crate::error::Error;
use crate::lifecycle::StateCell;
use crate::naming::{Naming, ServiceRecord, SubscribeCallback};
use crate::server::Server;
use crate::traits::{Dialer, Dispatcher};

pub use clients::{ClientMap, PeerEntry, ServiceState};
pub use selector::{hash_code, HashSelector, Selector};

const STATE_UNINITIALIZED: u32 = 0;
const STATE_INITIALIZED: u32 = 1;
const STATE_STARTED: u32 = 2;
const STATE_CLOSED: u32 = 3;

/// Warm-up before a newly discovered service may receive traffic.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(10);

/// Deadline for the server-shutdown fan-out during container shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle controller around one local server and its dependency fleet.
pub struct Container {
    state: StateCell,
    server: OnceLock<Arc<Server>>,
    deps: parking_lot::RwLock<Vec<String>>,
    naming: parking_lot::RwLock<Option<Arc<dyn Naming>>>,
    dialer: parking_lot::RwLock<Option<Arc<dyn Dialer>>>,
    selector: parking_lot::RwLock<Arc<dyn Selector>>,
    srv_clients: DashMap<String, Arc<ClientMap>>,
    warmup_ms: AtomicU64,
    /// Serialises client builds the way the original held the container
    /// lock across the existence check and the dial.
    build_lock: Mutex<()>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StateCell::new(STATE_UNINITIALIZED),
            server: OnceLock::new(),
            deps: parking_lot::RwLock::new(Vec::new()),
            naming: parking_lot::RwLock::new(None),
            dialer: parking_lot::RwLock::new(None),
            selector: parking_lot::RwLock::new(Arc::new(HashSelector)),
            srv_clients: DashMap::new(),
            warmup_ms: AtomicU64::new(DEFAULT_WARMUP.as_millis() as u64),
            build_lock: Mutex::new(()),
        }
    }

    /// Records the local server and the dependency service names.
    ///
    /// # Errors
    ///
    /// `Error::State` on a second init.
    pub fn init(&self, server: Arc<Server>, deps: &[&str]) -> Result<(), Error> {
        self.state
            .transition(STATE_UNINITIALIZED, STATE_INITIALIZED)?;

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for dep in deps {
            if seen.insert(dep.to_string()) {
                unique.push(dep.to_string());
            }
        }
        info!(
            module = "container",
            id = %server.service_id(),
            name = %server.service_name(),
            deps = ?unique,
            "init"
        );
        *self.deps.write() = unique;
        let _ = self.server.set(server);
        Ok(())
    }

    pub fn set_naming(&self, naming: Arc<dyn Naming>) {
        *self.naming.write() = Some(naming);
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write() = selector;
    }

    /// Overrides the young -> adult warm-up delay. Production keeps the
    /// default; tests shorten it.
    pub fn set_warmup(&self, warmup: Duration) {
        self.warmup_ms
            .store(warmup.as_millis() as u64, Ordering::Relaxed);
    }

    fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms.load(Ordering::Relaxed))
    }

    fn srv(&self) -> Result<Arc<Server>, Error> {
        self.server.get().cloned().ok_or(Error::NotInitialized)
    }

    /// Spawns the server, wires every declared dependency, and registers
    /// with naming when the server declares a public address. Returns once
    /// the wiring is in flight; `run` adds the block-on-signals behavior.
    ///
    /// # Errors
    ///
    /// `Error::NamingMissing` without a naming service, `Error::State` on a
    /// second start.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let naming = self.naming.read().clone().ok_or(Error::NamingMissing)?;
        self.state.transition(STATE_INITIALIZED, STATE_STARTED)?;
        let server = self.srv()?;

        let server_task = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = server_task.start().await {
                error!(module = "container", "server failed: {err}");
            }
        });

        for dep in self.deps.read().clone() {
            let container = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = container.connect_to_service(&dep).await {
                    error!(module = "container", dep = %dep, "dependency wiring failed: {err}");
                }
            });
        }

        if !server.service().address.is_empty() && server.service().port != 0 {
            if let Err(err) = naming.register(server.service()).await {
                error!(module = "container", "naming register failed: {err}");
            }
        }
        Ok(())
    }

    /// `start`, then block until a termination signal, then `shutdown`.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        self.start().await?;
        wait_for_signal().await?;
        self.shutdown().await
    }

    /// Gracefully stops the server, deregisters from naming, and
    /// unsubscribes every dependency. Once per container.
    ///
    /// # Errors
    ///
    /// `Error::State` when not started or already closed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.state.transition(STATE_STARTED, STATE_CLOSED)?;
        let server = self.srv()?;

        if let Err(err) = server.shutdown(SHUTDOWN_TIMEOUT).await {
            error!(module = "container", "server shutdown failed: {err}");
        }

        if let Some(naming) = self.naming.read().clone() {
            if let Err(err) = naming.deregister(server.service_id()).await {
                warn!(module = "container", "deregister failed: {err}");
            }
            for dep in self.deps.read().iter() {
                let _ = naming.unsubscribe(dep).await;
            }
        }

        info!(module = "container", id = %server.service_id(), "shutdown");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dependency wiring
    // -----------------------------------------------------------------------

    /// Installs the discovery watcher for `name`, then seeds from a
    /// point-in-time find. Subscribe goes first so no event can slip
    /// between the two; duplicate builds short-circuit on the existence
    /// check.
    pub async fn connect_to_service(self: &Arc<Self>, name: &str) -> Result<(), Error> {
        let clients = Arc::new(ClientMap::new());
        self.srv_clients.insert(name.to_string(), Arc::clone(&clients));
        let naming = self.naming.read().clone().ok_or(Error::NamingMissing)?;

        let callback: SubscribeCallback = {
            let container = Arc::clone(self);
            let clients = Arc::clone(&clients);
            Arc::new(move |services: Vec<ServiceRecord>| {
                let container = Arc::clone(&container);
                let clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    for service in services {
                        if clients.contains(&service.id) {
                            continue;
                        }
                        info!(
                            module = "container",
                            id = %service.id,
                            name = %service.name,
                            "watched a new service"
                        );
                        if let Err(err) = container
                            .build_client(&clients, service, ServiceState::Young)
                            .await
                        {
                            warn!(module = "container", "build client failed: {err}");
                        }
                    }
                });
            })
        };
        naming.subscribe(name, callback).await?;

        let services = naming.find(name, &[]).await?;
        info!(module = "container", name = %name, count = services.len(), "found services");
        for service in services {
            // Already warm: a node present at startup is selectable now.
            if let Err(err) = self
                .build_client(&clients, service, ServiceState::Adult)
                .await
            {
                warn!(module = "container", "build client failed: {err}");
            }
        }
        Ok(())
    }

    async fn build_client(
        self: &Arc<Self>,
        clients: &Arc<ClientMap>,
        service: ServiceRecord,
        initial: ServiceState,
    ) -> Result<(), Error> {
        let _guard = self.build_lock.lock().await;
        if clients.contains(&service.id) {
            return Ok(());
        }
        // Peer traffic is TCP-only; WebSocket is client-edge only.
        if service.protocol != wire::PROTOCOL_TCP {
            return Err(Error::UnexpectedProtocol {
                protocol: service.protocol.clone(),
            });
        }
        let dialer = self.dialer.read().clone().ok_or(Error::DialerMissing)?;

        let client = Arc::new(PeerClient::new(
            &service.id,
            &service.name,
            ClientOptions::default(),
        ));
        client.set_dialer(dialer);
        client.connect(&service.dial_url()).await?;

        let entry = PeerEntry::new(Arc::clone(&client), service.clone(), initial);
        clients.add(entry.clone());

        if initial == ServiceState::Young {
            let warmup = self.warmup();
            let entry_for_timer = entry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(warmup).await;
                entry_for_timer.promote();
            });
        }

        let container = Arc::clone(self);
        let clients = Arc::clone(clients);
        let service_id = service.id.clone();
        tokio::spawn(async move {
            info!(
                module = "container",
                id = %client.id(),
                name = %client.name(),
                "read loop started"
            );
            if let Err(err) = container.read_loop(&client).await {
                debug!(module = "container", id = %client.id(), "read loop ended: {err}");
            }
            clients.remove(&service_id);
            client.close().await;
        });
        Ok(())
    }

    /// Drains frames off a peer link, feeding pushed envelopes into
    /// `push_message`.
    async fn read_loop(&self, client: &Arc<PeerClient>) -> Result<(), Error> {
        loop {
            let frame = client.read().await?;
            if frame.opcode != OpCode::Binary {
                continue;
            }
            let packet = match LogicPkt::must_read(&frame.payload) {
                Ok(packet) => packet,
                Err(err) => {
                    error!(module = "container", "bad pushed envelope: {err}");
                    continue;
                }
            };
            if let Err(err) = self.push_message(packet).await {
                error!(module = "container", "push message failed: {err}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Forwarding plane
    // -----------------------------------------------------------------------

    /// Sends an envelope to one node of `service_name`, chosen by the
    /// configured selector over adult candidates.
    ///
    /// # Errors
    ///
    /// `Error::InvalidPacket` on missing command/channel id, lookup errors
    /// when no adult endpoint exists, and send errors from the peer link.
    pub async fn forward(&self, service_name: &str, packet: &mut LogicPkt) -> Result<(), Error> {
        if packet.header.command.is_empty() {
            return Err(Error::InvalidPacket {
                reason: "command is empty",
            });
        }
        if packet.header.channel_id.is_empty() {
            return Err(Error::InvalidPacket {
                reason: "channelId is empty",
            });
        }
        let selector = self.selector.read().clone();
        self.forward_with_selector(service_name, packet, selector.as_ref())
            .await
    }

    /// `forward` with an explicit selector.
    pub async fn forward_with_selector(
        &self,
        service_name: &str,
        packet: &mut LogicPkt,
        selector: &dyn Selector,
    ) -> Result<(), Error> {
        let client = self.lookup(service_name, &packet.header, selector)?;
        // Tag the packet so the callee knows where to push responses.
        packet.add_meta(wire::META_DEST_SERVER, self.srv()?.service_id());
        debug!(
            module = "container",
            to = %client.id(),
            header = %packet.header,
            "forward"
        );
        client.send(packet.marshal()).await
    }

    fn lookup(
        &self,
        service_name: &str,
        header: &skein_core::Header,
        selector: &dyn Selector,
    ) -> Result<Arc<PeerClient>, Error> {
        let clients = self
            .srv_clients
            .get(service_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ServiceNotFound {
                name: service_name.to_string(),
            })?;

        let candidates = clients.services(ServiceState::Adult);
        if candidates.is_empty() {
            return Err(Error::NoServices {
                name: service_name.to_string(),
            });
        }
        let id = selector
            .lookup(header, &candidates)
            .ok_or_else(|| Error::NoServices {
                name: service_name.to_string(),
            })?;
        clients
            .get(&id)
            .map(|entry| entry.client)
            .ok_or(Error::ClientNotFound { id })
    }

    /// Delivers an envelope to the channel registered under `server_id` on
    /// the local server, tagging it with the destination so the receiving
    /// gateway can validate ownership.
    pub async fn push(&self, server_id: &str, packet: &mut LogicPkt) -> Result<(), Error> {
        packet.add_meta(wire::META_DEST_SERVER, server_id);
        self.srv()?.push(server_id, packet.marshal()).await
    }

    /// Fan-out of an envelope pushed back by a logic node: validates the
    /// destination gateway, strips the routing meta, and delivers to each
    /// listed channel. A missing channel is logged and skipped; the other
    /// deliveries continue.
    pub async fn push_message(&self, mut packet: LogicPkt) -> Result<(), Error> {
        let server = self.srv()?;

        let dest = packet
            .get_meta(wire::META_DEST_SERVER)
            .unwrap_or_default()
            .to_string();
        if dest != server.service_id() {
            return Err(Error::WrongDestServer {
                got: dest,
                want: server.service_id().to_string(),
            });
        }
        let channels = packet
            .get_meta(wire::META_DEST_CHANNELS)
            .ok_or(Error::MissingDestChannels)?
            .to_string();

        packet.del_meta(wire::META_DEST_SERVER);
        packet.del_meta(wire::META_DEST_CHANNELS);
        let payload = packet.marshal();
        debug!(module = "container", channels = %channels, header = %packet.header, "push");

        for channel_id in channels.split(',') {
            if let Err(err) = server.push(channel_id, payload.clone()).await {
                error!(module = "container", id = %channel_id, "push failed: {err}");
            }
        }
        Ok(())
    }

    /// The service map for one dependency, if wired.
    #[must_use]
    pub fn clients_of(&self, service_name: &str) -> Option<Arc<ClientMap>> {
        self.srv_clients
            .get(service_name)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
    }
    info!(module = "container", "termination signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(module = "container", "termination signal received");
    Ok(())
}

/// Container-backed dispatcher: delivers one envelope to a channel set on
/// a gateway by stamping the fan-out meta and pushing.
pub struct ContainerDispatcher {
    container: Arc<Container>,
}

impl ContainerDispatcher {
    #[must_use]
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }
}

#[async_trait]
impl Dispatcher for ContainerDispatcher {
    async fn push(
        &self,
        gateway: &str,
        channels: &[String],
        packet: &mut LogicPkt,
    ) -> Result<(), Error> {
        packet.add_meta(wire::META_DEST_CHANNELS, &channels.join(","));
        self.container.push(gateway, packet).await
    }
}
