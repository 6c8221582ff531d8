//! Error taxonomy for the runtime.
//!
//! Variants map to semantic kinds rather than transport details: lifecycle
//! violations, remote closes, deadlines, lookup misses, protocol
//! violations, and transient dial failures. Reader/writer tasks return
//! these to a single owner that performs teardown; nothing panics out.

use thiserror::Error;

use skein_core::WireError;

use crate::lifecycle::StateError;

#[derive(Debug, Error)]
pub enum Error {
    // -- lifecycle violations ------------------------------------------------
    #[error(transparent)]
    State(#[from] StateError),
    #[error("container is not initialized")]
    NotInitialized,

    // -- remote-closed / deadline -------------------------------------------
    #[error("remote side closed the channel")]
    RemoteClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("{kind} deadline expired")]
    Deadline { kind: &'static str },

    // -- not-found -----------------------------------------------------------
    #[error("channel {id} not found")]
    ChannelNotFound { id: String },
    #[error("channel {id} has closed")]
    ChannelClosed { id: String },
    #[error("service {name} not found")]
    ServiceNotFound { name: String },
    #[error("no services found for {name}")]
    NoServices { name: String },
    #[error("no client found for service {id}")]
    ClientNotFound { id: String },

    // -- protocol violations -------------------------------------------------
    #[error("channelId is repeated")]
    DuplicateChannel { id: String },
    #[error("must be a login.signin command, got {command}")]
    InvalidCommand { command: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },
    #[error("{reason} in packet")]
    InvalidPacket { reason: &'static str },
    #[error("dest_server is incorrect, {got} != {want}")]
    WrongDestServer { got: String, want: String },
    #[error("dest_channels is empty")]
    MissingDestChannels,
    #[error(transparent)]
    Wire(#[from] WireError),

    // -- wiring --------------------------------------------------------------
    #[error("dialer is not set")]
    DialerMissing,
    #[error("naming is not set")]
    NamingMissing,
    #[error("state listener is not set")]
    StateListenerMissing,
    #[error("message listener is not set")]
    MessageListenerMissing,
    #[error("unexpected service protocol {protocol}")]
    UnexpectedProtocol { protocol: String },
    #[error("service {name} already subscribed")]
    AlreadySubscribed { name: String },

    // -- transport -----------------------------------------------------------
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}
