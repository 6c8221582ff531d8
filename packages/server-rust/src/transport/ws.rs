//! RFC 6455 WebSocket wire profile over tokio-tungstenite.
//!
//! Binary messages carry envelope payloads; Ping/Pong/Close map onto the
//! shared opcode space, with the Close reason carried as payload text.
//! tungstenite merges fragments and unmasks client frames before they
//! reach this adapter, so the `Frame` contract holds unchanged.

use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use skein_core::{Frame, OpCode};

use crate::error::Error;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Unsplit WebSocket connection adapter.
pub struct WsConn {
    stream: WsStream,
    peer: Option<SocketAddr>,
}

impl WsConn {
    /// Server side: performs the HTTP upgrade on an accepted socket.
    pub async fn accept(stream: TcpStream) -> Result<Self, Error> {
        let peer = stream.peer_addr().ok();
        let stream = accept_async(MaybeTlsStream::Plain(stream)).await?;
        Ok(Self { stream, peer })
    }

    /// Client side: dials `ws://host:port` and completes the upgrade.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Self { stream, peer: None })
    }

    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        next_frame(&mut self.stream).await
    }

    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.stream.feed(frame_to_message(opcode, payload)).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await?;
        Ok(())
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn split(self) -> (WsReader, WsWriter) {
        let (sink, stream) = self.stream.split();
        (WsReader { inner: stream }, WsWriter { inner: sink })
    }
}

/// Read half of a split WebSocket connection.
pub struct WsReader {
    inner: SplitStream<WsStream>,
}

impl WsReader {
    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        next_frame(&mut self.inner).await
    }
}

/// Write half of a split WebSocket connection.
pub struct WsWriter {
    inner: SplitSink<WsStream, Message>,
}

impl WsWriter {
    pub async fn write_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.inner.feed(frame_to_message(opcode, payload)).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await?;
        Ok(())
    }
}

async fn next_frame<S>(stream: &mut S) -> Result<Frame, Error>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(message)) => Ok(message_to_frame(message)),
        Some(Err(err)) => Err(err.into()),
        None => Err(Error::ConnectionClosed),
    }
}

fn frame_to_message(opcode: OpCode, payload: Vec<u8>) -> Message {
    match opcode {
        OpCode::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
        OpCode::Ping => Message::Ping(payload),
        OpCode::Pong => Message::Pong(payload),
        OpCode::Close => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: String::from_utf8_lossy(&payload).into_owned().into(),
        })),
        // Continuation never leaves the channel layer; carry it as binary.
        OpCode::Binary | OpCode::Continuation => Message::Binary(payload),
    }
}

fn message_to_frame(message: Message) -> Frame {
    match message {
        Message::Binary(data) => Frame::new(OpCode::Binary, data),
        Message::Text(text) => Frame::new(OpCode::Text, text.into_bytes()),
        Message::Ping(data) => Frame::new(OpCode::Ping, data),
        Message::Pong(data) => Frame::new(OpCode::Pong, data),
        Message::Close(close) => Frame::new(
            OpCode::Close,
            close
                .map(|frame| frame.reason.into_owned().into_bytes())
                .unwrap_or_default(),
        ),
        // Raw frames only appear when reading in raw mode; treat as an
        // empty continuation, which the channel layer drops.
        Message::Frame(_) => Frame::new(OpCode::Continuation, Vec::new()),
    }
}
