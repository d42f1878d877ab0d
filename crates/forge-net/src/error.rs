//! Transport error types.

use std::io;
use std::net::SocketAddr;

use tokio_tungstenite::tungstenite;

/// Errors surfaced by [`Transport`](crate::Transport) lifecycle calls.
///
/// Per-connection failures never reach the caller as errors; they close the
/// offending connection and are reported as events.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// `start_*` was called on a running transport.
    #[error("transport is already started")]
    AlreadyStarted,

    /// The address could not be resolved.
    #[error("failed to resolve {address}:{port}: {source}")]
    Resolve {
        /// Address as given.
        address: String,
        /// Port as given.
        port: u16,
        /// Resolver failure.
        #[source]
        source: io::Error,
    },

    /// The listening socket could not be created.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address the listener was bound to.
        addr: SocketAddr,
        /// Socket failure.
        #[source]
        source: io::Error,
    },

    /// The I/O thread pool could not be created.
    #[error("failed to start I/O threads: {0}")]
    Runtime(#[source] io::Error),

    /// The WebSocket upgrade failed.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    /// The WebSocket upgrade did not finish in time.
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
}
