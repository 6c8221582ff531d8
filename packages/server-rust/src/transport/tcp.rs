//! Length-prefixed TCP wire profile.
//!
//! Frame layout: one opcode byte, a 4-byte big-endian payload length, then
//! the payload. No masking. Writes land in a buffered half and reach the
//! socket on `flush`, which is what makes the channel's write coalescing a
//! real syscall saver.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use skein_core::{Frame, OpCode, WireError};

use crate::error::Error;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 16 << 20;

type DynRead = Box<dyn AsyncRead + Send + Unpin>;
type DynWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Unsplit TCP connection adapter.
pub struct TcpConn {
    reader: TcpReader,
    writer: TcpWriter,
    peer: Option<SocketAddr>,
}

impl TcpConn {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(read_half, write_half, peer)
    }

    /// Builds an adapter over arbitrary halves. Tests hand in in-memory
    /// duplex pipes and flush-counting writers through this.
    pub fn from_parts(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            reader: TcpReader {
                inner: BufReader::new(Box::new(read) as DynRead),
            },
            writer: TcpWriter {
                inner: BufWriter::new(Box::new(write) as DynWrite),
            },
            peer,
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.writer.write_frame(opcode, payload).await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().await
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn split(self) -> (TcpReader, TcpWriter) {
        (self.reader, self.writer)
    }
}

/// Read half: decodes frames off a buffered stream.
pub struct TcpReader {
    inner: BufReader<DynRead>,
}

impl TcpReader {
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        let opcode_byte = match self.inner.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed);
            }
            Err(err) => return Err(err.into()),
        };
        let opcode = OpCode::try_from(opcode_byte)?;

        let len = self.inner.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::LengthOverflow {
                got: len,
                limit: MAX_FRAME_LEN,
            }
            .into());
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Frame::new(opcode, payload))
    }
}

/// Write half: encodes frames into a buffered stream; `flush` is the
/// syscall boundary.
pub struct TcpWriter {
    inner: BufWriter<DynWrite>,
}

impl TcpWriter {
    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.inner.write_u8(opcode as u8).await?;
        self.inner.write_u32(payload.len() as u32).await?;
        self.inner.write_all(&payload).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await?;
        Ok(())
    }
}
