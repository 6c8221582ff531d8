use thiserror::Error;

/// Decode/encode failures for frames and envelope packets.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("length field {got} exceeds limit {limit}")]
    LengthOverflow { got: usize, limit: usize },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpCode(u8),
    #[error("unknown packet magic {0:02x?}")]
    UnknownMagic([u8; 4]),
    #[error("unknown flag {0}")]
    UnknownFlag(u8),
    #[error("unknown status {0}")]
    UnknownStatus(u32),
    #[error("unexpected {got} packet")]
    UnexpectedPacket { got: &'static str },
    #[error("body decode failed: {0}")]
    BodyDecode(#[from] prost::DecodeError),
}
