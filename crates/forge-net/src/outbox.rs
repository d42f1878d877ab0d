//! Send-side operations shared by the transport and its callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;

use crate::codec::WireCodec;
use crate::config::TransportConfig;
use crate::dispatch::DispatchQueue;
use crate::entity::{EntityHandle, QueueRefusal};
use crate::guid::{ConnectionId, IdGenerator};
use crate::registry::EntityRegistry;
use crate::stats::NetCounters;
use crate::transport::Role;

const ROLE_NONE: u8 = 0;
const ROLE_SERVER: u8 = 1;
const ROLE_CLIENT: u8 = 2;

/// State shared by the transport, its I/O tasks and every [`Outbox`].
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) codec: WireCodec,
    pub(crate) registry: EntityRegistry,
    pub(crate) queue: DispatchQueue,
    pub(crate) ids: IdGenerator,
    pub(crate) counters: NetCounters,
    role: AtomicU8,
}

impl Shared {
    pub(crate) fn new(config: TransportConfig) -> Self {
        Self {
            codec: WireCodec::new(config.max_body_len),
            registry: EntityRegistry::new(usize::MAX),
            queue: DispatchQueue::new(config.queue.clone()),
            ids: IdGenerator::with_node(config.node_id),
            counters: NetCounters::new(),
            role: AtomicU8::new(ROLE_NONE),
            config,
        }
    }

    pub(crate) fn set_role(&self, role: Role) {
        let raw = match role {
            Role::Server => ROLE_SERVER,
            Role::Client => ROLE_CLIENT,
        };
        self.role.store(raw, Ordering::Release);
    }

    pub(crate) fn role(&self) -> Option<Role> {
        match self.role.load(Ordering::Acquire) {
            ROLE_SERVER => Some(Role::Server),
            ROLE_CLIENT => Some(Role::Client),
            _ => None,
        }
    }
}

/// Cloneable handle for sending and closing connections.
///
/// Obtained from [`Transport::outbox`](crate::Transport::outbox) and passed to
/// every callback, so handlers can reply while the queue is being drained.
/// All operations are non-blocking and report failure through their return
/// value.
#[derive(Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn target(&self, id: ConnectionId) -> Option<EntityHandle> {
        if id.is_none() && self.shared.role() == Some(Role::Client) {
            self.shared.registry.any()
        } else {
            self.shared.registry.get(id)
        }
    }

    fn enqueue(&self, handle: &EntityHandle, frame: Bytes) -> bool {
        match handle.enqueue(frame) {
            Ok(()) => true,
            Err(QueueRefusal::NotOpen) => {
                tracing::debug!("Connection {} is closing, send refused", handle.id());
                false
            }
            Err(QueueRefusal::Full) => {
                tracing::warn!("Send queue full for connection {}, message refused", handle.id());
                false
            }
        }
    }

    /// Encode a message and queue it on connection `id`.
    ///
    /// In the client role [`ConnectionId::NONE`] addresses the single server
    /// connection. Returns false if the connection is unknown or not `Open`,
    /// its send queue is full, or the body exceeds the size limit.
    pub fn send_message(&self, msg_id: u16, body: &[u8], id: ConnectionId, route: ConnectionId) -> bool {
        let Some(handle) = self.target(id) else {
            tracing::debug!("Send to unknown connection {id} dropped");
            return false;
        };

        match self.shared.codec.encode(msg_id, route, body) {
            Ok(frame) => self.enqueue(&handle, frame),
            Err(e) => {
                tracing::warn!("Refusing to send message {msg_id} to {id}: {e}");
                false
            }
        }
    }

    /// Send one message to every `Open` connection not listed in `exclude`.
    ///
    /// Works on a snapshot of the registry; a connection that closes
    /// meanwhile only fails its own send. Returns false only when the
    /// message cannot be encoded.
    pub fn send_to_all(&self, msg_id: u16, body: &[u8], route: ConnectionId, exclude: &[ConnectionId]) -> bool {
        match self.shared.codec.encode(msg_id, route, body) {
            Ok(frame) => {
                let delivered = self.broadcast(&frame, exclude);
                tracing::trace!("Broadcast message {msg_id} to {delivered} connections");
                true
            }
            Err(e) => {
                tracing::warn!("Refusing to broadcast message {msg_id}: {e}");
                false
            }
        }
    }

    /// Queue an encoded frame on every eligible connection. Returns how many
    /// accepted it.
    pub(crate) fn broadcast(&self, frame: &Bytes, exclude: &[ConnectionId]) -> usize {
        self.shared
            .registry
            .snapshot_open()
            .iter()
            .filter(|handle| !exclude.contains(&handle.id()))
            .filter(|handle| self.enqueue(handle, frame.clone()))
            .count()
    }

    /// Start closing connection `id`. Queued sends are flushed first and a
    /// `Disconnected` event follows once the socket is released.
    ///
    /// Returns false if the connection is unknown or already closing.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.target(id) {
            Some(handle) => handle.request_close(),
            None => false,
        }
    }

    /// Whether `id` names an `Open` connection.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.target(id).is_some_and(|handle| handle.is_open())
    }

    /// Number of `Open` connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.count_open()
    }
}
