//! Transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_BODY_LEN;
use crate::dispatch::QueueConfig;
use crate::platform::SocketConfig;

/// Settings shared by every role and framing of [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Node number stamped into the upper bits of every connection id.
    pub node_id: u16,
    /// Largest body a peer may declare. Default: 64 KiB.
    pub max_body_len: u32,
    /// Bytes reserved in the receive buffer per socket read. Default: 4096.
    pub read_chunk_size: usize,
    /// Encoded messages that may wait per connection before sends fail. Default: 1024.
    pub send_queue_capacity: usize,
    /// Close connections silent for this long, 0 to disable. Default: 0.
    pub idle_timeout_ms: u64,
    /// Upper bound on the WebSocket upgrade handshake. Default: 5000.
    pub handshake_timeout_ms: u64,
    /// Upper bound on an outbound TCP connect. Default: 5000.
    pub connect_timeout_ms: u64,
    /// Time allowed for flushing queued sends when closing. Default: 2000.
    pub shutdown_grace_ms: u64,
    /// Socket options.
    pub socket: SocketConfig,
    /// I/O to logic thread queue.
    pub queue: QueueConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            read_chunk_size: 4096,
            send_queue_capacity: 1024,
            idle_timeout_ms: 0,
            handshake_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
            socket: SocketConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// WebSocket handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Outbound connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Grace period for flushing queued sends.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OverflowPolicy;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_body_len, 65_536);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config: TransportConfig =
            ron::from_str("(idle_timeout_ms: 1500, queue: (overflow: Block(timeout_ms: 10)))").unwrap();
        assert_eq!(config.idle_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.queue.overflow, OverflowPolicy::Block { timeout_ms: 10 });
        assert_eq!(config.queue.capacity, Some(65_536));
        assert_eq!(config.send_queue_capacity, 1024);
    }
}
