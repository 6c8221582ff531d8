//! Client-edge handler: login handshake, inbound dispatch, teardown.
//!
//! The first inbound envelope must be `login.signin` carrying a token. The
//! gateway verifies it, mints a channel id of the form
//! `"<gatewayId>_<account>_<seq>"`, rewrites the packet body to a
//! `Session`, and forwards to the login service. Later envelopes are
//! routed by command prefix; envelope-level pings are answered in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{error, info};

use skein_core::proto::{LoginReq, Session};
use skein_core::{wire, BasicPkt, LogicPkt, OpCode, Packet, Status, CODE_PING, SEQ};

use crate::container::Container;
use crate::error::Error;
use crate::traits::{Acceptor, Agent, MessageListener, Metadata, StateListener, TokenVerifier};
use crate::transport::Connection;

/// Gateway-side acceptor + listeners, one instance per gateway process.
pub struct Handler {
    service_id: String,
    container: Arc<Container>,
    tokens: Arc<dyn TokenVerifier>,
}

impl Handler {
    #[must_use]
    pub fn new(service_id: &str, container: Arc<Container>, tokens: Arc<dyn TokenVerifier>) -> Self {
        Self {
            service_id: service_id.to_string(),
            container,
            tokens,
        }
    }
}

fn generate_channel_id(service_id: &str, account: &str) -> String {
    format!("{service_id}_{account}_{}", SEQ.next())
}

#[async_trait]
impl Acceptor for Handler {
    async fn accept(
        &self,
        conn: &mut Connection,
        login_wait: Duration,
    ) -> Result<(String, Metadata), Error> {
        let frame = match timeout(login_wait, conn.read_frame()).await {
            Ok(read) => read?,
            Err(_) => return Err(Error::Deadline { kind: "login" }),
        };
        let mut req = LogicPkt::must_read(&frame.payload)?;

        if req.header.command != wire::COMMAND_LOGIN_SIGNIN {
            let resp = LogicPkt::from_header(&req.header).with_status(Status::InvalidCommand);
            let _ = conn.write_frame(OpCode::Binary, resp.marshal()).await;
            let _ = conn.flush().await;
            return Err(Error::InvalidCommand {
                command: req.header.command.clone(),
            });
        }

        let login: LoginReq = req.read_body()?;
        let token = match self.tokens.parse(&login.token) {
            Ok(token) => token,
            Err(err) => {
                let resp = LogicPkt::from_header(&req.header).with_status(Status::Unauthorized);
                let _ = conn.write_frame(OpCode::Binary, resp.marshal()).await;
                let _ = conn.flush().await;
                return Err(err);
            }
        };

        let id = generate_channel_id(&self.service_id, &token.account);
        let remote_ip = conn
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();

        req.header.channel_id = id.clone();
        req.write_body(&Session {
            account: token.account.clone(),
            channel_id: id.clone(),
            gate_id: self.service_id.clone(),
            app: token.app.clone(),
            remote_ip,
        });
        self.container.forward(wire::SN_LOGIN, &mut req).await?;

        let mut metadata = Metadata::new();
        metadata.insert(wire::META_ACCOUNT.to_string(), token.account);
        metadata.insert(wire::META_APP.to_string(), token.app);
        Ok((id, metadata))
    }
}

#[async_trait]
impl MessageListener for Handler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let Ok(packet) = Packet::read(&payload) else {
            return;
        };

        match packet {
            Packet::Basic(basic) => {
                if basic.code == CODE_PING {
                    let _ = agent.push(BasicPkt::pong().marshal()).await;
                }
            }
            Packet::Logic(mut logic) => {
                logic.header.channel_id = agent.id().to_string();
                let service = logic.service_name().to_string();
                if let Err(err) = self.container.forward(&service, &mut logic).await {
                    error!(
                        module = "handler",
                        id = %agent.id(),
                        command = %logic.header.command,
                        dest = %logic.header.dest,
                        "forward failed: {err}"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl StateListener for Handler {
    async fn disconnect(&self, channel_id: &str) -> Result<(), Error> {
        info!(module = "handler", id = %channel_id, "disconnect");
        let mut logout = LogicPkt::new(wire::COMMAND_LOGIN_SIGNOUT).with_channel(channel_id);
        if let Err(err) = self.container.forward(wire::SN_LOGIN, &mut logout).await {
            error!(module = "handler", id = %channel_id, "logout forward failed: {err}");
        }
        Ok(())
    }
}
