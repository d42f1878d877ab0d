//! Byte-level adapters over plain TCP and WebSocket connections.
//!
//! Plain TCP is a byte stream that feeds the receive accumulator. A
//! WebSocket connection delivers whole messages, each carrying exactly one
//! encoded frame.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::NetError;
use crate::transport::Role;

type WsStream = WebSocketStream<TcpStream>;

/// Result of one read.
pub(crate) enum ReadOutcome {
    /// This many bytes were appended to the accumulator.
    Bytes(usize),
    /// One complete WebSocket message.
    Frame(Bytes),
    /// The peer closed the connection.
    Eof,
}

/// Read side of a connection.
pub(crate) enum FrameReader {
    Tcp(OwnedReadHalf),
    WebSocket(SplitStream<WsStream>),
}

/// Write side of a connection.
pub(crate) enum FrameWriter {
    Tcp(OwnedWriteHalf),
    WebSocket(SplitSink<WsStream, Message>),
}

/// Split a plain TCP stream.
pub(crate) fn split_tcp(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (reader, writer) = stream.into_split();
    (FrameReader::Tcp(reader), FrameWriter::Tcp(writer))
}

/// Run the HTTP upgrade for `role` and split the resulting WebSocket.
///
/// Incoming messages and frames longer than `max_message_len` are refused
/// before their payload is buffered; the read then fails with
/// [`io::ErrorKind::InvalidData`].
pub(crate) async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
    timeout: Duration,
    max_message_len: usize,
) -> Result<(FrameReader, FrameWriter), NetError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(max_message_len))
        .max_frame_size(Some(max_message_len));
    let handshake = async {
        match role {
            Role::Server => tokio_tungstenite::accept_async_with_config(stream, Some(config)).await,
            Role::Client => {
                tokio_tungstenite::client_async_with_config(format!("ws://{peer}/"), stream, Some(config))
                    .await
                    .map(|(ws, _response)| ws)
            }
        }
    };

    let ws = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| NetError::HandshakeTimeout)??;
    let (sink, stream) = ws.split();
    Ok((FrameReader::WebSocket(stream), FrameWriter::WebSocket(sink)))
}

fn ws_to_io(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::from(io::ErrorKind::NotConnected)
        }
        tungstenite::Error::Capacity(e) => io::Error::new(io::ErrorKind::InvalidData, e),
        other => io::Error::other(other),
    }
}

impl FrameReader {
    /// Wait for the next chunk of input. Cancel-safe.
    ///
    /// Stream input is appended to `recv` after reserving `chunk` bytes;
    /// WebSocket messages are returned whole. Control frames are consumed
    /// here and never surface.
    pub(crate) async fn read(&mut self, recv: &mut BytesMut, chunk: usize) -> io::Result<ReadOutcome> {
        match self {
            FrameReader::Tcp(half) => {
                recv.reserve(chunk.max(1));
                let n = half.read_buf(recv).await?;
                Ok(if n == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Bytes(n)
                })
            }
            FrameReader::WebSocket(stream) => loop {
                match stream.next().await {
                    None | Some(Ok(Message::Close(_))) => return Ok(ReadOutcome::Eof),
                    Some(Ok(Message::Binary(payload))) => return Ok(ReadOutcome::Frame(payload)),
                    Some(Ok(Message::Text(text))) => {
                        return Ok(ReadOutcome::Frame(Bytes::copy_from_slice(text.as_bytes())));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ws_to_io(e)),
                }
            },
        }
    }
}

impl FrameWriter {
    /// Write one encoded frame.
    pub(crate) async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        match self {
            FrameWriter::Tcp(half) => half.write_all(&frame).await,
            FrameWriter::WebSocket(sink) => sink.send(Message::Binary(frame)).await.map_err(ws_to_io),
        }
    }

    /// Half-close the TCP stream or send the WebSocket close frame.
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            FrameWriter::Tcp(half) => half.shutdown().await,
            FrameWriter::WebSocket(sink) => sink.close().await.map_err(ws_to_io),
        }
    }
}
