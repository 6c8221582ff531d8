//! Capability traits at the seams of the runtime.
//!
//! Handlers plug in here: an `Acceptor` authenticates fresh connections, a
//! `MessageListener` consumes inbound payloads, a `StateListener` observes
//! teardown, a `Dialer` owns outbound connect-and-handshake, and a
//! `TokenVerifier` abstracts the credential primitives the gateway checks
//! at login. Transports stay tagged enums (see `transport`); only the
//! pluggable behavior lives behind traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use skein_core::LogicPkt;

use crate::error::Error;
use crate::transport::Connection;

/// Per-channel string metadata (account, app, peer service id, ...).
pub type Metadata = HashMap<String, String>;

/// The minimal push-capable view of a channel exposed to message handlers.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn metadata(&self) -> &Metadata;
    /// Enqueues one payload toward the remote side. Blocks on backpressure,
    /// fails once the channel has closed.
    async fn push(&self, payload: Vec<u8>) -> Result<(), Error>;
}

/// Authentication hook run on a fresh connection before a channel exists.
///
/// Reads whatever handshake the deployment requires (bounded by
/// `login_wait`) and returns the channel id plus its initial metadata.
/// An error closes the connection with an `OpClose` frame carrying the
/// error text.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(
        &self,
        conn: &mut Connection,
        login_wait: Duration,
    ) -> Result<(String, Metadata), Error>;
}

/// Upstream consumer of inbound channel payloads. Invoked on a fresh task
/// per frame, so implementations may block without stalling frame intake.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>);
}

/// Observer of channel teardown.
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn disconnect(&self, channel_id: &str) -> Result<(), Error>;
}

/// Parameters handed to a `Dialer`.
#[derive(Debug, Clone)]
pub struct DialContext {
    /// Service id of the dialing side, advertised during the handshake.
    pub id: String,
    /// Service name of the dialing side.
    pub name: String,
    /// `host:port` of the remote service.
    pub address: String,
    pub timeout: Duration,
}

/// Outbound connect-and-handshake hook. The dialer owns both the TCP
/// connect and whatever first-frame handshake the peer expects.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<Connection, Error>;
}

/// Claims extracted from a verified login token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub account: String,
    pub app: String,
}

/// Credential check run by the gateway on `login.signin`. The concrete
/// signing scheme lives outside this crate.
pub trait TokenVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` for tokens that fail verification.
    fn parse(&self, token: &str) -> Result<AccessToken, Error>;
}

/// Delivery of one envelope to a set of channels on a gateway. Logic-tier
/// services use this to answer back to connected clients.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn push(
        &self,
        gateway: &str,
        channels: &[String],
        packet: &mut LogicPkt,
    ) -> Result<(), Error>;
}
