//! Peer-to-peer handshake: both halves of the inner wire contract.
//!
//! The dialing side sends an `InnerHandshakeReq` advertising its service
//! id as the first binary frame after TCP connect; no response is
//! required. The accepting side reads that frame within the login deadline
//! and uses the advertised id as the inbound channel id, tagging the
//! channel metadata with it.

use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use skein_core::proto::InnerHandshakeReq;
use skein_core::{OpCode, WireError};

use crate::error::Error;
use crate::traits::{Acceptor, DialContext, Dialer, Metadata};
use crate::transport::{Connection, TcpConn};

/// Channel metadata key carrying the peer's advertised service id.
pub const META_PEER_SERVICE: &str = "peer_service_id";

/// TCP dialer that advertises the local service id after connecting.
pub struct PeerDialer {
    service_id: String,
}

impl PeerDialer {
    #[must_use]
    pub fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for PeerDialer {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<Connection, Error> {
        let stream = match timeout(ctx.timeout, TcpStream::connect(&ctx.address)).await {
            Ok(connected) => connected?,
            Err(_) => return Err(Error::Deadline { kind: "dial" }),
        };
        let mut conn = Connection::Tcp(TcpConn::new(stream));

        let req = InnerHandshakeReq {
            service_id: self.service_id.clone(),
        };
        debug!(module = "dialer", service_id = %req.service_id, "send inner handshake");
        conn.write_frame(OpCode::Binary, req.encode_to_vec()).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

/// Acceptor for inbound peer links: first frame is the inner handshake.
pub struct PeerAcceptor;

#[async_trait]
impl Acceptor for PeerAcceptor {
    async fn accept(
        &self,
        conn: &mut Connection,
        login_wait: Duration,
    ) -> Result<(String, Metadata), Error> {
        let frame = match timeout(login_wait, conn.read_frame()).await {
            Ok(read) => read?,
            Err(_) => return Err(Error::Deadline { kind: "login" }),
        };
        let req = InnerHandshakeReq::decode(frame.payload.as_slice())
            .map_err(WireError::from)?;
        if req.service_id.is_empty() {
            return Err(Error::Handshake {
                reason: "empty service id".to_string(),
            });
        }

        let mut metadata = Metadata::new();
        metadata.insert(META_PEER_SERVICE.to_string(), req.service_id.clone());
        Ok((req.service_id, metadata))
    }
}
