//! Per-connection I/O tasks.
//!
//! Each connection runs one reader task (which owns the
//! [`ConnectionEntity`] and its receive accumulator) and one writer task
//! (which owns the outbound queue). Close is a two-phase handshake:
//!
//! 1. The state moves to `Closing`; new sends are refused.
//! 2. The writer flushes what was already queued (bounded by the grace
//!    period) and shuts the socket down.
//! 3. Both halves are dropped, the registry entry is removed, the state moves
//!    to `Closed`, and only then is `Disconnected` queued for the logic
//!    thread.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;

use crate::codec::{CodecError, HEADER_LEN, MessageHeader};
use crate::dispatch::{Dispatched, NetEvent};
use crate::entity::{CloseReason, ConnectionEntity, StateCell};
use crate::guid::ConnectionId;
use crate::outbox::Shared;
use crate::platform::configure_stream;
use crate::stream::{self, FrameReader, FrameWriter, ReadOutcome};
use crate::transport::{Role, TransportKind};

/// Drive one connection from socket-open to `Closed`.
pub(crate) async fn run(
    shared: Arc<Shared>,
    id: ConnectionId,
    socket: TcpStream,
    peer: SocketAddr,
    kind: TransportKind,
    role: Role,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = configure_stream(&socket, &shared.config.socket) {
        tracing::warn!("Failed to configure socket for {peer}: {e}");
    }

    let (mut entity, handle) = ConnectionEntity::new(id, peer, shared.config.send_queue_capacity);
    let Some(pending) = entity.take_pending_send() else {
        abandon(&shared, &entity, role);
        return;
    };

    let (mut reader, writer) = match kind {
        TransportKind::Tcp => stream::split_tcp(socket),
        TransportKind::WebSocket => {
            let max_message_len = HEADER_LEN + shared.config.max_body_len as usize;
            let timeout = shared.config.handshake_timeout();
            match stream::upgrade(socket, peer, role, timeout, max_message_len).await {
                Ok(halves) => halves,
                Err(e) => {
                    tracing::warn!("Connection {id} from {peer} failed during handshake: {e}");
                    abandon(&shared, &entity, role);
                    return;
                }
            }
        }
    };

    if *shutdown.borrow() {
        abandon(&shared, &entity, role);
        return;
    }

    if let Err(e) = shared.registry.add(handle) {
        tracing::warn!("Rejecting connection {id} from {peer}: {e}");
        shared.counters.record_rejected();
        abandon(&shared, &entity, role);
        return;
    }

    entity.state_cell().open();
    shared.counters.record_accepted();
    shared.queue.push_event(id, NetEvent::Connected, 0);
    tracing::info!("Connection {id} open with {peer}");

    let (closing_tx, closing_rx) = watch::channel(false);
    let writer_task = tokio::spawn(write_loop(
        Arc::clone(&shared),
        id,
        writer,
        pending,
        closing_rx,
        Arc::clone(entity.state_cell()),
        entity.close_signal(),
    ));

    let mut reason = read_loop(&shared, &mut entity, &mut reader, &mut shutdown).await;

    entity.state_cell().begin_closing();
    let _ = closing_tx.send(true);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(_)) if reason == CloseReason::Local => reason = CloseReason::SendFailed,
        Ok(Err(_)) => {}
        Err(e) => tracing::error!("Writer task for {id} failed: {e}"),
    }
    drop(reader);

    if shared.registry.remove(id).is_some() {
        entity.state_cell().close();
        shared.queue.push_event(id, NetEvent::Disconnected, reason.code());
        tracing::info!("Connection {id} closed ({reason:?})");
    } else {
        entity.state_cell().close();
    }
}

/// Dispose of a connection that never reached `Open`.
///
/// A client learns of the failed connect through `Disconnected`; a server
/// never announces connections it did not open.
fn abandon(shared: &Shared, entity: &ConnectionEntity, role: Role) {
    entity.state_cell().close();
    if role == Role::Client {
        shared
            .queue
            .push_event(entity.id(), NetEvent::Disconnected, CloseReason::ConnectFailed.code());
    }
}

/// Report a connect attempt that failed before a socket existed.
pub(crate) fn connect_failed(shared: &Shared, id: ConnectionId) {
    shared
        .queue
        .push_event(id, NetEvent::Disconnected, CloseReason::ConnectFailed.code());
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn read_loop(
    shared: &Shared,
    entity: &mut ConnectionEntity,
    reader: &mut FrameReader,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason {
    let id = entity.id();
    let close = entity.close_signal();
    let idle = shared.config.idle_timeout();
    let chunk = shared.config.read_chunk_size;
    let mut deadline = idle.map(|d| Instant::now() + d);

    loop {
        let idle_expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = close.notified() => return CloseReason::Local,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return CloseReason::Shutdown;
                }
            }
            _ = idle_expired => {
                tracing::info!("Connection {id} idle for {:?}, closing", idle.unwrap_or_default());
                return CloseReason::IdleTimeout;
            }
            result = reader.read(entity.recv_buffer(), chunk) => {
                match result {
                    Ok(ReadOutcome::Eof) => return CloseReason::Remote,
                    Ok(ReadOutcome::Bytes(n)) => {
                        shared.counters.record_bytes_in(n as u64);
                        deadline = idle.map(|d| Instant::now() + d);
                        if let Err(reason) = dispatch_buffered(shared, entity).await {
                            return reason;
                        }
                    }
                    Ok(ReadOutcome::Frame(payload)) => {
                        shared.counters.record_bytes_in(payload.len() as u64);
                        deadline = idle.map(|d| Instant::now() + d);
                        if let Err(reason) = dispatch_frame(shared, entity, payload).await {
                            return reason;
                        }
                    }
                    Err(e) if is_transient(&e) => continue,
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        tracing::warn!("Protocol error on connection {id}: {e}");
                        let too_large = CodecError::BodyTooLarge {
                            size: 0,
                            max: shared.config.max_body_len,
                        };
                        shared.queue.push_event(id, NetEvent::RecvError, too_large.code());
                        return CloseReason::Protocol;
                    }
                    Err(e) => {
                        tracing::debug!("Connection {id} read failed: {e}");
                        return CloseReason::Io;
                    }
                }
            }
        }
    }
}

/// Decode every complete message in the accumulator and queue it.
async fn dispatch_buffered(shared: &Shared, entity: &mut ConnectionEntity) -> Result<(), CloseReason> {
    loop {
        match entity.next_message(&shared.codec) {
            Ok(Some((header, body))) => deliver(shared, entity.id(), header, body).await,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("Protocol error on connection {}: {e}", entity.id());
                shared.queue.push_event(entity.id(), NetEvent::RecvError, e.code());
                return Err(CloseReason::Protocol);
            }
        }
    }
}

/// Decode one message-delimited frame and queue it.
async fn dispatch_frame(shared: &Shared, entity: &mut ConnectionEntity, payload: Bytes) -> Result<(), CloseReason> {
    match entity.accept_frame(&shared.codec, payload) {
        Ok((header, body)) => {
            deliver(shared, entity.id(), header, body).await;
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Protocol error on connection {}: {e}", entity.id());
            shared.queue.push_event(entity.id(), NetEvent::RecvError, e.code());
            Err(CloseReason::Protocol)
        }
    }
}

async fn deliver(shared: &Shared, id: ConnectionId, header: MessageHeader, body: Bytes) {
    shared.counters.record_message_in();
    tracing::trace!("Connection {id} received message {} ({} bytes)", header.msg_id, body.len());
    shared.queue.push(Dispatched::Message { id, header, body }).await;
}

async fn write_loop(
    shared: Arc<Shared>,
    id: ConnectionId,
    mut writer: FrameWriter,
    mut pending: mpsc::Receiver<Bytes>,
    mut closing: watch::Receiver<bool>,
    state: Arc<StateCell>,
    close: Arc<Notify>,
) -> io::Result<()> {
    let result = flush_until_closed(&shared, &mut writer, &mut pending, &mut closing).await;

    if let Err(e) = &result {
        tracing::warn!("Connection {id} send failed: {e}");
        shared
            .queue
            .push_event(id, NetEvent::SendError, e.raw_os_error().unwrap_or(-1));
        if state.begin_closing() {
            close.notify_one();
        }
    }
    result
}

async fn flush_until_closed(
    shared: &Shared,
    writer: &mut FrameWriter,
    pending: &mut mpsc::Receiver<Bytes>,
    closing: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            biased;
            frame = pending.recv() => match frame {
                Some(frame) => {
                    let len = frame.len() as u64;
                    writer.write(frame).await?;
                    shared.counters.record_message_out(len);
                }
                None => break,
            },
            _ = closing.changed() => break,
        }
    }

    // Flush what was queued before the close, within the grace period.
    let grace = shared.config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Ok(frame) = pending.try_recv() {
            let len = frame.len() as u64;
            writer.write(frame).await?;
            shared.counters.record_message_out(len);
        }
        Ok::<(), io::Error>(())
    })
    .await;

    match drained {
        Ok(result) => result?,
        Err(_) => tracing::warn!("Pending sends not flushed within {grace:?}, discarding"),
    }

    match writer.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
        _ => Ok(()),
    }
}
