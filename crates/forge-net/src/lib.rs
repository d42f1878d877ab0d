//! Network transport core: connection identity, wire framing, the
//! connection registry, and the hand-off of decoded messages from the I/O
//! threads to a single logic thread.

pub mod codec;
pub mod config;
mod connection;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod guid;
pub mod outbox;
pub mod platform;
pub mod registry;
pub mod stats;
mod stream;
pub mod transport;

pub use codec::{CodecError, DEFAULT_MAX_BODY_LEN, Decoded, HEADER_LEN, MessageHeader, WireCodec};
pub use config::TransportConfig;
pub use dispatch::{DispatchQueue, Dispatched, NetEvent, OverflowPolicy, QueueConfig, QueueStats};
pub use entity::{CloseReason, ConnectionEntity, EntityHandle, EntityState};
pub use error::NetError;
pub use guid::{ConnectionId, IdGenerator};
pub use outbox::Outbox;
pub use platform::SocketConfig;
pub use registry::{EntityRegistry, RegistryError};
pub use stats::NetStats;
pub use transport::{ClientOptions, NetHandler, Role, ServerOptions, Transport, TransportKind};
