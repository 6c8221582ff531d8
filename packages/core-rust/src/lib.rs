//! Wire-level contract shared by every node of the skein fabric.
//!
//! Gateways, logic services, and SDK clients all speak the same two-layer
//! protocol: transport frames (`Frame` with an `OpCode`) carrying envelope
//! packets (`LogicPkt` for routable commands, `BasicPkt` for
//! application-level liveness). This crate owns those types and their
//! big-endian codecs, the protobuf payload messages carried inside envelope
//! bodies, and the constants (commands, service names, meta keys, default
//! deadlines) that both sides of every link must agree on.
//!
//! Nothing in here does I/O; the server crate layers transports, channels,
//! and routing on top.

pub mod endian;
pub mod error;
pub mod frame;
pub mod packet;
pub mod proto;
pub mod sequence;
pub mod wire;

pub use error::WireError;
pub use frame::{Frame, OpCode};
pub use packet::{
    BasicPkt, Flag, Header, LogicPkt, Packet, Status, CODE_PING, CODE_PONG, MAGIC_BASIC_PKT,
    MAGIC_LOGIC_PKT,
};
pub use sequence::{Sequence, SEQ};
