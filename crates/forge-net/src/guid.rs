//! Connection identities.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const COUNTER_BITS: u32 = 48;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Identity of a live connection, also carried in message headers as a
/// routing key.
///
/// The upper 16 bits hold the node that minted the id, the lower 48 bits a
/// per-node counter. [`ConnectionId::NONE`] marks an absent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// The "no identity" value written into headers that carry no route.
    pub const NONE: ConnectionId = ConnectionId(0);

    /// Whether this is [`ConnectionId::NONE`].
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Node number encoded in the identity.
    pub fn node(self) -> u16 {
        (self.0 >> COUNTER_BITS) as u16
    }

    /// Per-node sequence number encoded in the identity.
    pub fn sequence(self) -> u64 {
        self.0 & COUNTER_MASK
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node(), self.sequence())
    }
}

impl From<u64> for ConnectionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
///
/// Ids are never handed out twice by the same generator, so a transport that
/// is shut down and started again keeps minting fresh identities.
pub struct IdGenerator {
    node: u16,
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator for node 0, starting at 1.
    pub fn new() -> Self {
        Self::with_node(0)
    }

    /// Create a generator whose ids carry `node` in their upper bits.
    pub fn with_node(node: u16) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        ConnectionId((u64::from(self.node) << COUNTER_BITS) | seq)
    }

    /// Node number stamped into every id.
    pub fn node(&self) -> u16 {
        self.node
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
