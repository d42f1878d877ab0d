//! Per-connection state.
//!
//! A [`ConnectionEntity`] is owned by the I/O task that drives its socket and
//! holds the receive accumulator. The [`EntityHandle`] is the shareable half
//! stored in the registry: identity, lifecycle state, the bounded outbound
//! queue and the close signal. The registry never owns an entity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, mpsc};

use crate::codec::{CodecError, Decoded, HEADER_LEN, MessageHeader, WireCodec};
use crate::guid::ConnectionId;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EntityState {
    /// Socket accepted or connect issued, handshake not finished.
    Connecting = 0,
    /// Ready for traffic in both directions.
    Open = 1,
    /// Close requested or detected; queued sends are flushed, new ones refused.
    Closing = 2,
    /// Socket released and registry entry erased.
    Closed = 3,
}

impl EntityState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EntityState::Connecting,
            1 => EntityState::Open,
            2 => EntityState::Closing,
            _ => EntityState::Closed,
        }
    }
}

/// Atomic [`EntityState`] shared between an entity and its handle.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in `state`.
    pub fn new(state: EntityState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Current state.
    pub fn get(&self) -> EntityState {
        EntityState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Connecting -> Open`. Returns false if the entity was not connecting.
    pub fn open(&self) -> bool {
        self.transition(EntityState::Connecting, EntityState::Open)
    }

    /// Move to `Closing` from `Connecting` or `Open`.
    ///
    /// Returns true for exactly one caller; later callers observe that the
    /// close is already under way.
    pub fn begin_closing(&self) -> bool {
        self.transition(EntityState::Open, EntityState::Closing)
            || self.transition(EntityState::Connecting, EntityState::Closing)
    }

    /// Terminal transition.
    pub fn close(&self) {
        self.0.store(EntityState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: EntityState, to: EntityState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Why a connection closed. The code is delivered with `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket.
    Remote,
    /// `close_connection` was called locally.
    Local,
    /// The transport is shutting down.
    Shutdown,
    /// The peer violated the wire protocol.
    Protocol,
    /// Reset, broken pipe, or another fatal socket error.
    Io,
    /// No inbound traffic within the configured idle timeout.
    IdleTimeout,
    /// Flushing the outbound queue failed.
    SendFailed,
    /// An outbound connect or its handshake never completed.
    ConnectFailed,
}

impl CloseReason {
    /// Numeric code carried as the event's aux value.
    pub fn code(self) -> i32 {
        match self {
            CloseReason::Remote => 0,
            CloseReason::Local => 1,
            CloseReason::Shutdown => 2,
            CloseReason::Protocol => 3,
            CloseReason::Io => 4,
            CloseReason::IdleTimeout => 5,
            CloseReason::SendFailed => 6,
            CloseReason::ConnectFailed => 7,
        }
    }
}

/// Registry-side view of a connection.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: Arc<StateCell>,
    outbox: mpsc::Sender<Bytes>,
    close: Arc<Notify>,
}

/// Why a frame could not be queued on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRefusal {
    /// The entity is not `Open`.
    NotOpen,
    /// The bounded outbound queue is full.
    Full,
}

impl EntityHandle {
    /// Identity of the connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state.get()
    }

    /// Whether the connection accepts new sends.
    pub fn is_open(&self) -> bool {
        self.state.get() == EntityState::Open
    }

    /// Queue an encoded frame for the I/O task. Never blocks.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), QueueRefusal> {
        if !self.is_open() {
            return Err(QueueRefusal::NotOpen);
        }
        self.outbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueRefusal::Full,
            mpsc::error::TrySendError::Closed(_) => QueueRefusal::NotOpen,
        })
    }

    /// Ask the owning I/O task to close the connection.
    ///
    /// Returns false if the connection was already closing.
    pub fn request_close(&self) -> bool {
        if self.state.begin_closing() {
            self.close.notify_one();
            true
        } else {
            false
        }
    }

    /// Force the terminal state. Used when the registry is cleared without
    /// waiting for the I/O task.
    pub(crate) fn mark_closed(&self) {
        self.state.close();
        self.close.notify_one();
    }
}

/// I/O-side state of one connection: identity, receive accumulator, and the
/// receiving ends of the outbound queue and close signal.
pub struct ConnectionEntity {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: Arc<StateCell>,
    recv: BytesMut,
    close: Arc<Notify>,
    pending_send: Option<mpsc::Receiver<Bytes>>,
    decoded: u64,
}

impl ConnectionEntity {
    /// Create an entity in `Connecting` together with its registry handle.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        send_queue_capacity: usize,
    ) -> (Self, EntityHandle) {
        let state = Arc::new(StateCell::new(EntityState::Connecting));
        let close = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(send_queue_capacity.max(1));

        let entity = Self {
            id,
            peer_addr,
            state: Arc::clone(&state),
            recv: BytesMut::new(),
            close: Arc::clone(&close),
            pending_send: Some(rx),
            decoded: 0,
        };
        let handle = EntityHandle {
            id,
            peer_addr,
            state,
            outbox: tx,
            close,
        };
        (entity, handle)
    }

    /// Identity of the connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state.get()
    }

    /// Shared state cell.
    pub(crate) fn state_cell(&self) -> &Arc<StateCell> {
        &self.state
    }

    /// Signal fired by [`EntityHandle::request_close`].
    pub(crate) fn close_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.close)
    }

    /// Hand the outbound queue to the writer task. Returns `None` after the
    /// first call.
    pub(crate) fn take_pending_send(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.pending_send.take()
    }

    /// Receive accumulator for stream transports.
    pub fn recv_buffer(&mut self) -> &mut BytesMut {
        &mut self.recv
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    /// Number of messages decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Append raw bytes to the accumulator.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.recv.extend_from_slice(bytes);
    }

    /// Pop the next complete message from the accumulator.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The body is split off the
    /// accumulator without copying.
    pub fn next_message(&mut self, codec: &WireCodec) -> Result<Option<(MessageHeader, Bytes)>, CodecError> {
        let (header, consumed) = match codec.decode(&self.recv)? {
            Decoded::NeedMoreData => return Ok(None),
            Decoded::Frame {
                header, consumed, ..
            } => (header, consumed),
        };

        let mut frame = self.recv.split_to(consumed);
        let body = frame.split_off(HEADER_LEN).freeze();
        self.decoded += 1;
        Ok(Some((header, body)))
    }

    /// Decode a message-delimited frame (one WebSocket message).
    pub fn accept_frame(&mut self, codec: &WireCodec, frame: Bytes) -> Result<(MessageHeader, Bytes), CodecError> {
        let (header, _) = codec.decode_exact(&frame)?;
        self.decoded += 1;
        Ok((header, frame.slice(HEADER_LEN..)))
    }
}
