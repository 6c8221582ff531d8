//! Transport frame model shared by the TCP and WebSocket profiles.
//!
//! Both wire profiles surface the same semantic shape: an opcode plus an
//! opaque payload. Adapters merge fragments before constructing a `Frame`,
//! so no fragmentation semantics leak above the transport layer.

use crate::error::WireError;

/// Frame opcode. Values follow the RFC 6455 opcode space so the WebSocket
/// profile maps one-to-one; the TCP profile writes the same byte verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// One transport frame: an opcode and its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Shorthand for the most common frame kind: a binary envelope carrier.
    #[must_use]
    pub fn binary(payload: Vec<u8>) -> Self {
        Self::new(OpCode::Binary, payload)
    }
}
