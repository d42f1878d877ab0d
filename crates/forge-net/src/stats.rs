//! Traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dispatch::QueueStats;

/// Live counters bumped by the I/O tasks without locking.
#[derive(Debug, Default)]
pub struct NetCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl NetCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes read from a socket.
    pub fn record_bytes_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A decoded inbound message.
    pub fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    /// An encoded message written to a socket.
    pub fn record_message_out(&self, wire_bytes: u64) {
        self.bytes_out.fetch_add(wire_bytes, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection reached `Open`.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection was refused before opening.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self, queue: QueueStats) -> NetStats {
        NetStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connections_rejected: self.rejected.load(Ordering::Relaxed),
            queue,
        }
    }
}

/// Point-in-time copy of the transport's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Raw bytes received.
    pub bytes_in: u64,
    /// Encoded bytes written.
    pub bytes_out: u64,
    /// Messages decoded.
    pub messages_in: u64,
    /// Messages written.
    pub messages_out: u64,
    /// Connections that reached `Open`.
    pub connections_accepted: u64,
    /// Connections refused by the connection limit.
    pub connections_rejected: u64,
    /// Dispatch queue pressure.
    pub queue: QueueStats,
}
