//! Transport adapters: one semantic frame shape over two wire profiles.
//!
//! `Connection` wraps a raw duplex byte stream with frame-granular reads
//! and writes. The TCP profile is length-prefixed binary, the WebSocket
//! profile is RFC 6455 framing; both surface the same `Frame` model, so
//! everything above this module is transport-agnostic. Splitting a
//! connection yields independently-owned reader and writer halves for the
//! channel's two I/O tasks.

pub mod tcp;
pub mod ws;

use std::net::SocketAddr;

use skein_core::{Frame, OpCode};

use crate::error::Error;

pub use tcp::{TcpConn, TcpReader, TcpWriter};
pub use ws::WsConn;

/// Wire profile of a server or service record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ws,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ws => "ws",
        }
    }
}

/// A live duplex link speaking one of the two wire profiles.
pub enum Connection {
    Tcp(TcpConn),
    Ws(WsConn),
}

impl Connection {
    /// Reads one frame. Fragments are merged below this call; a cleanly
    /// closed stream surfaces as `Error::ConnectionClosed`.
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        match self {
            Connection::Tcp(conn) => conn.read_frame().await,
            Connection::Ws(conn) => conn.read_frame().await,
        }
    }

    /// Writes one frame without flushing.
    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        match self {
            Connection::Tcp(conn) => conn.write_frame(opcode, payload).await,
            Connection::Ws(conn) => conn.write_frame(opcode, payload).await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        match self {
            Connection::Tcp(conn) => conn.flush().await,
            Connection::Ws(conn) => conn.flush().await,
        }
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Tcp(conn) => conn.peer_addr(),
            Connection::Ws(conn) => conn.peer_addr(),
        }
    }

    /// Splits into independently-owned halves for the reader and writer
    /// tasks.
    #[must_use]
    pub fn split(self) -> (ConnReader, ConnWriter) {
        match self {
            Connection::Tcp(conn) => {
                let (reader, writer) = conn.split();
                (ConnReader::Tcp(reader), ConnWriter::Tcp(writer))
            }
            Connection::Ws(conn) => {
                let (reader, writer) = conn.split();
                (ConnReader::Ws(reader), ConnWriter::Ws(writer))
            }
        }
    }
}

/// Read half of a split connection.
pub enum ConnReader {
    Tcp(TcpReader),
    Ws(ws::WsReader),
}

impl ConnReader {
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        match self {
            ConnReader::Tcp(reader) => reader.read_frame().await,
            ConnReader::Ws(reader) => reader.read_frame().await,
        }
    }
}

/// Write half of a split connection.
pub enum ConnWriter {
    Tcp(TcpWriter),
    Ws(ws::WsWriter),
}

impl ConnWriter {
    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        match self {
            ConnWriter::Tcp(writer) => writer.write_frame(opcode, payload).await,
            ConnWriter::Ws(writer) => writer.write_frame(opcode, payload).await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        match self {
            ConnWriter::Tcp(writer) => writer.flush().await,
            ConnWriter::Ws(writer) => writer.flush().await,
        }
    }
}
