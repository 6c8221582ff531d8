//! Envelope packets: the application layer carried inside `Binary` frames.
//!
//! Two packet kinds share the wire, told apart by a fixed 4-byte magic
//! prefix: `LogicPkt` (a routable command envelope with header, meta, and
//! an opaque protobuf body) and `BasicPkt` (envelope-level liveness,
//! distinct from transport Ping/Pong opcodes). All integers are
//! big-endian; meta is kept ordered so marshal∘unmarshal is byte-identity.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;

use crate::endian;
use crate::error::WireError;
use crate::sequence::SEQ;

/// Magic prefix of a marshalled `LogicPkt`.
pub const MAGIC_LOGIC_PKT: [u8; 4] = [0xc3, 0x11, 0xa3, 0x65];
/// Magic prefix of a marshalled `BasicPkt`.
pub const MAGIC_BASIC_PKT: [u8; 4] = [0xc3, 0x15, 0xa7, 0x65];

/// Envelope-level heartbeat codes.
pub const CODE_PING: u16 = 0x1;
pub const CODE_PONG: u16 = 0x2;

// ---------------------------------------------------------------------------
// Flag / Status
// ---------------------------------------------------------------------------

/// Direction/kind of a logic envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Flag {
    #[default]
    Request = 1,
    Response = 2,
    Push = 3,
}

impl TryFrom<u8> for Flag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Flag::Request),
            2 => Ok(Flag::Response),
            3 => Ok(Flag::Push),
            other => Err(WireError::UnknownFlag(other)),
        }
    }
}

/// Response status carried in envelope headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Status {
    #[default]
    Success = 0,
    NoDestination = 100,
    InvalidPacketBody = 101,
    InvalidCommand = 103,
    Unauthorized = 401,
    SystemException = 500,
    NotImplemented = 501,
}

impl TryFrom<u32> for Status {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Success),
            100 => Ok(Status::NoDestination),
            101 => Ok(Status::InvalidPacketBody),
            103 => Ok(Status::InvalidCommand),
            401 => Ok(Status::Unauthorized),
            500 => Ok(Status::SystemException),
            501 => Ok(Status::NotImplemented),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Routing header of a `LogicPkt`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// Dotted command, e.g. `chat.talk`. The prefix before the first `.`
    /// names the service the envelope is routed to.
    pub command: String,
    /// Id of the client channel the envelope originated from (or is
    /// destined to). The consistent-hash affinity key.
    pub channel_id: String,
    pub sequence: u32,
    pub flag: Flag,
    pub status: Status,
    /// Application-level destination (account, group id); opaque to routing.
    pub dest: String,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] channel={} dest={} status={:?}",
            self.command, self.sequence, self.channel_id, self.dest, self.status
        )
    }
}

// ---------------------------------------------------------------------------
// LogicPkt
// ---------------------------------------------------------------------------

/// Routable command envelope. `meta` carries ephemeral routing hints
/// (`dest_server`, `dest_channels`); `body` is an opaque protobuf payload
/// interpreted only by the receiving command handler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogicPkt {
    pub header: Header,
    meta: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl LogicPkt {
    /// Creates a request envelope with a fresh global sequence.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            header: Header {
                command: command.to_string(),
                sequence: SEQ.next(),
                ..Header::default()
            },
            meta: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Creates a response shell from a request header: command, channel,
    /// dest, sequence and flag are copied so the peer can correlate.
    #[must_use]
    pub fn from_header(header: &Header) -> Self {
        Self {
            header: Header {
                command: header.command.clone(),
                channel_id: header.channel_id.clone(),
                sequence: header.sequence,
                flag: header.flag,
                dest: header.dest.clone(),
                status: Status::Success,
            },
            meta: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel_id: &str) -> Self {
        self.header.channel_id = channel_id.to_string();
        self
    }

    #[must_use]
    pub fn with_dest(mut self, dest: &str) -> Self {
        self.header.dest = dest.to_string();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.header.status = status;
        self
    }

    /// Service name the command routes to: the prefix before the first `.`.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.header
            .command
            .split_once('.')
            .map_or(self.header.command.as_str(), |(service, _)| service)
    }

    pub fn add_meta(&mut self, key: &str, value: &str) {
        self.meta.insert(key.to_string(), value.to_string());
    }

    #[must_use]
    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn del_meta(&mut self, key: &str) -> Option<String> {
        self.meta.remove(key)
    }

    /// Decodes the body as a protobuf message.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BodyDecode` when the body does not parse as `M`.
    pub fn read_body<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.body.as_slice())?)
    }

    /// Replaces the body with the encoding of a protobuf message.
    pub fn write_body(&mut self, msg: &impl Message) {
        self.body = msg.encode_to_vec();
    }

    /// Encodes magic prefix plus the full envelope.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_LOGIC_PKT);
        endian::put_string(&mut buf, &self.header.command);
        endian::put_string(&mut buf, &self.header.channel_id);
        buf.put_u32(self.header.sequence);
        buf.put_u8(self.header.flag as u8);
        buf.put_u32(self.header.status as u32);
        endian::put_string(&mut buf, &self.header.dest);
        buf.put_u32(self.meta.len() as u32);
        for (key, value) in &self.meta {
            endian::put_string(&mut buf, key);
            endian::put_string(&mut buf, value);
        }
        endian::put_bytes(&mut buf, &self.body);
        buf.to_vec()
    }

    /// Reads one envelope, requiring it to be a `LogicPkt`.
    ///
    /// # Errors
    ///
    /// Returns `WireError::UnexpectedPacket` for a `BasicPkt` and the usual
    /// decode errors for malformed input.
    pub fn must_read(bytes: &[u8]) -> Result<Self, WireError> {
        match Packet::read(bytes)? {
            Packet::Logic(pkt) => Ok(pkt),
            Packet::Basic(_) => Err(WireError::UnexpectedPacket { got: "basic" }),
        }
    }

    fn decode_fields(buf: &mut impl Buf) -> Result<Self, WireError> {
        let command = endian::get_string(buf)?;
        let channel_id = endian::get_string(buf)?;
        let sequence = endian::get_u32(buf)?;
        let flag = Flag::try_from(endian::get_u8(buf)?)?;
        let status = Status::try_from(endian::get_u32(buf)?)?;
        let dest = endian::get_string(buf)?;

        let meta_count = endian::get_u32(buf)?;
        let mut meta = BTreeMap::new();
        for _ in 0..meta_count {
            let key = endian::get_string(buf)?;
            let value = endian::get_string(buf)?;
            meta.insert(key, value);
        }
        let body = endian::get_bytes(buf)?;

        Ok(Self {
            header: Header {
                command,
                channel_id,
                sequence,
                flag,
                status,
                dest,
            },
            meta,
            body,
        })
    }
}

impl fmt::Display for LogicPkt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} meta={:?} body={}B", self.header, self.meta, self.body.len())
    }
}

// ---------------------------------------------------------------------------
// BasicPkt
// ---------------------------------------------------------------------------

/// Envelope-level heartbeat packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicPkt {
    pub code: u16,
}

impl BasicPkt {
    #[must_use]
    pub const fn ping() -> Self {
        Self { code: CODE_PING }
    }

    #[must_use]
    pub const fn pong() -> Self {
        Self { code: CODE_PONG }
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_slice(&MAGIC_BASIC_PKT);
        buf.put_u16(self.code);
        buf.to_vec()
    }

    fn decode_fields(buf: &mut impl Buf) -> Result<Self, WireError> {
        Ok(Self {
            code: endian::get_u16(buf)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Packet dispatch
// ---------------------------------------------------------------------------

/// Either envelope kind, dispatched on the magic prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Basic(BasicPkt),
    Logic(LogicPkt),
}

impl Packet {
    /// Decodes one envelope from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `WireError::UnknownMagic` when the prefix matches neither
    /// packet kind, and decode errors for malformed field data.
    pub fn read(bytes: &[u8]) -> Result<Self, WireError> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(WireError::Truncated {
                needed: 4 - buf.remaining(),
            });
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);

        match magic {
            MAGIC_LOGIC_PKT => Ok(Packet::Logic(LogicPkt::decode_fields(&mut buf)?)),
            MAGIC_BASIC_PKT => Ok(Packet::Basic(BasicPkt::decode_fields(&mut buf)?)),
            other => Err(WireError::UnknownMagic(other)),
        }
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            Packet::Basic(pkt) => pkt.marshal(),
            Packet::Logic(pkt) => pkt.marshal(),
        }
    }
}
