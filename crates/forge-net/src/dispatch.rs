//! Hand-off of decoded traffic from the I/O tasks to the logic thread.
//!
//! Any number of I/O tasks push into a [`DispatchQueue`]; the logic thread
//! calls [`DispatchQueue::drain_all`] once per tick. Each connection is served
//! by a single task that pushes in decode order, so per-connection order is
//! preserved. Order across connections is unspecified.
//!
//! Only data messages count against the capacity. Lifecycle events are always
//! accepted so that every `Connected` is matched by exactly one `Disconnected`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::MessageHeader;
use crate::guid::ConnectionId;

/// Connection lifecycle notifications delivered to the logic thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEvent {
    /// A connection became `Open`.
    Connected,
    /// A connection reached `Closed`; its identity is no longer addressable.
    Disconnected,
    /// Inbound data violated the wire protocol. The aux code is the
    /// [`CodecError`](crate::CodecError) code.
    RecvError,
    /// Writing to the socket failed. The aux code is the OS error, or -1.
    SendError,
}

/// One unit of work for the logic thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A decoded inbound message.
    Message {
        /// Connection the message arrived on.
        id: ConnectionId,
        /// Decoded header.
        header: MessageHeader,
        /// Message body.
        body: Bytes,
    },
    /// A lifecycle event.
    Event {
        /// Connection the event concerns.
        id: ConnectionId,
        /// What happened.
        event: NetEvent,
        /// Event-specific code.
        code: i32,
    },
}

impl Dispatched {
    /// Connection this item belongs to.
    pub fn id(&self) -> ConnectionId {
        match self {
            Dispatched::Message { id, .. } | Dispatched::Event { id, .. } => *id,
        }
    }

    /// Whether this is a data message (as opposed to an event).
    pub fn is_message(&self) -> bool {
        matches!(self, Dispatched::Message { .. })
    }
}

/// What a producer does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the oldest queued data message to make room.
    DropOldest,
    /// Wait for the logic thread to drain, giving up after `timeout_ms` and
    /// discarding the new message.
    Block {
        /// Longest time a producer waits for space.
        timeout_ms: u64,
    },
}

/// Sizing and back-pressure for a [`DispatchQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued data messages, `None` for unbounded.
    pub capacity: Option<usize>,
    /// Behaviour when `capacity` is reached.
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Some(65_536),
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Counters describing queue pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted (messages and events).
    pub pushed: u64,
    /// Messages discarded by [`OverflowPolicy::DropOldest`].
    pub dropped: u64,
    /// Messages discarded after a [`OverflowPolicy::Block`] timeout.
    pub timed_out: u64,
    /// Largest number of items ever queued at once.
    pub high_water: usize,
}

struct Inner {
    items: VecDeque<Dispatched>,
    messages: usize,
    overflowing: bool,
}

/// Many-producer, single-consumer FIFO between I/O tasks and the logic thread.
pub struct DispatchQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    space: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    high_water: AtomicUsize,
}

impl DispatchQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                messages: 0,
                overflowing: false,
            }),
            space: Notify::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, inner: &mut Inner, item: Dispatched) {
        if item.is_message() {
            inner.messages += 1;
        }
        inner.items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.high_water.fetch_max(inner.items.len(), Ordering::Relaxed);
    }

    /// Queue a lifecycle event. Events bypass the capacity limit.
    pub fn push_event(&self, id: ConnectionId, event: NetEvent, code: i32) {
        let mut inner = self.lock();
        self.append(&mut inner, Dispatched::Event { id, event, code });
    }

    /// Queue an item, applying the overflow policy to data messages.
    ///
    /// Returns false if the item was discarded. Never waits longer than the
    /// configured block timeout.
    pub async fn push(&self, item: Dispatched) -> bool {
        let capacity = match self.config.capacity {
            Some(capacity) if item.is_message() => capacity,
            _ => {
                let mut inner = self.lock();
                self.append(&mut inner, item);
                return true;
            }
        };

        match self.config.overflow {
            OverflowPolicy::DropOldest => self.push_drop_oldest(item, capacity),
            OverflowPolicy::Block { timeout_ms } => {
                self.push_blocking(item, capacity, Duration::from_millis(timeout_ms))
                    .await
            }
        }
    }

    fn push_drop_oldest(&self, item: Dispatched, capacity: usize) -> bool {
        let mut inner = self.lock();
        if inner.messages >= capacity {
            let Some(oldest) = inner.items.iter().position(Dispatched::is_message) else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            };
            if let Some(evicted) = inner.items.remove(oldest) {
                tracing::trace!("Dispatch queue full, evicting message from {}", evicted.id());
            }
            inner.messages -= 1;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !inner.overflowing {
                inner.overflowing = true;
                tracing::warn!("Dispatch queue reached capacity {capacity}, dropping oldest messages");
            }
        }
        self.append(&mut inner, item);
        true
    }

    async fn push_blocking(&self, item: Dispatched, capacity: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let space = self.space.notified();
            {
                let mut inner = self.lock();
                if inner.messages < capacity {
                    self.append(&mut inner, item);
                    return true;
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Dispatch queue full for {timeout:?}, discarding message from {}",
                    item.id()
                );
                return false;
            }
        }
    }

    /// Take everything queued since the previous drain, in push order.
    pub fn drain_all(&self) -> Vec<Dispatched> {
        let drained = {
            let mut inner = self.lock();
            inner.messages = 0;
            inner.overflowing = false;
            std::mem::take(&mut inner.items)
        };
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained.into()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Snapshot of the pressure counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn message(id: u64, msg_id: u16) -> Dispatched {
        Dispatched::Message {
            id: ConnectionId(id),
            header: MessageHeader {
                msg_id,
                body_len: 0,
                route: ConnectionId::NONE,
            },
            body: Bytes::new(),
        }
    }

    fn msg_ids(items: &[Dispatched]) -> Vec<u16> {
        items
            .iter()
            .filter_map(|item| match item {
                Dispatched::Message { header, .. } => Some(header.msg_id),
                Dispatched::Event { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_drain_preserves_push_order() {
        let queue = DispatchQueue::new(QueueConfig::default());
        for msg_id in 0..10 {
            assert!(queue.push(message(1, msg_id)).await);
        }
        let drained = queue.drain_all();
        assert_eq!(msg_ids(&drained), (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_events_interleave_in_order() {
        let queue = DispatchQueue::new(QueueConfig::default());
        queue.push_event(ConnectionId(1), NetEvent::Connected, 0);
        queue.push(message(1, 7)).await;
        queue.push_event(ConnectionId(1), NetEvent::Disconnected, 0);

        let drained = queue.drain_all();
        assert!(matches!(drained[0], Dispatched::Event { event: NetEvent::Connected, .. }));
        assert!(drained[1].is_message());
        assert!(matches!(drained[2], Dispatched::Event { event: NetEvent::Disconnected, .. }));
    }

    #[test]
    fn test_per_connection_order_with_many_producers() {
        let queue = Arc::new(DispatchQueue::new(QueueConfig {
            capacity: None,
            overflow: OverflowPolicy::DropOldest,
        }));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let producers: Vec<_> = (1..=4u64)
                .map(|conn| {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        for msg_id in 0..500u16 {
                            queue.push(message(conn, msg_id)).await;
                        }
                    })
                })
                .collect();
            for producer in producers {
                producer.await.unwrap();
            }
        });

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2000);
        for conn in 1..=4u64 {
            let ids: Vec<_> = drained
                .iter()
                .filter(|item| item.id() == ConnectionId(conn))
                .cloned()
                .collect();
            assert_eq!(msg_ids(&ids), (0..500).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_counts_and_keeps_newest() {
        let queue = DispatchQueue::new(QueueConfig {
            capacity: Some(3),
            overflow: OverflowPolicy::DropOldest,
        });
        for msg_id in 0..5 {
            assert!(queue.push(message(1, msg_id)).await);
        }

        assert_eq!(queue.stats().dropped, 2);
        assert_eq!(msg_ids(&queue.drain_all()), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_events_are_never_dropped() {
        let queue = DispatchQueue::new(QueueConfig {
            capacity: Some(1),
            overflow: OverflowPolicy::DropOldest,
        });
        queue.push_event(ConnectionId(1), NetEvent::Connected, 0);
        queue.push(message(1, 1)).await;
        queue.push(message(1, 2)).await;
        queue.push_event(ConnectionId(1), NetEvent::Disconnected, 0);

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(msg_ids(&drained), vec![2]);
        assert_eq!(drained.iter().filter(|item| !item.is_message()).count(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_times_out() {
        let queue = DispatchQueue::new(QueueConfig {
            capacity: Some(1),
            overflow: OverflowPolicy::Block { timeout_ms: 20 },
        });
        assert!(queue.push(message(1, 1)).await);

        let started = std::time::Instant::now();
        assert!(!queue.push(message(1, 2)).await);
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(queue.stats().timed_out, 1);
        assert_eq!(msg_ids(&queue.drain_all()), vec![1]);
    }

    #[tokio::test]
    async fn test_block_policy_resumes_after_drain() {
        let queue = Arc::new(DispatchQueue::new(QueueConfig {
            capacity: Some(1),
            overflow: OverflowPolicy::Block { timeout_ms: 5_000 },
        }));
        queue.push(message(1, 1)).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(message(1, 2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(msg_ids(&queue.drain_all()), vec![1]);

        assert!(producer.await.unwrap());
        assert_eq!(msg_ids(&queue.drain_all()), vec![2]);
        assert_eq!(queue.stats().timed_out, 0);
    }

    #[tokio::test]
    async fn test_stats_track_high_water() {
        let queue = DispatchQueue::new(QueueConfig::default());
        for msg_id in 0..4 {
            queue.push(message(1, msg_id)).await;
        }
        queue.drain_all();
        queue.push(message(1, 9)).await;

        let stats = queue.stats();
        assert_eq!(stats.pushed, 5);
        assert_eq!(stats.high_water, 4);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_config_from_ron() {
        let config: QueueConfig = ron::from_str("(capacity: Some(8), overflow: Block(timeout_ms: 50))").unwrap();
        assert_eq!(config.capacity, Some(8));
        assert_eq!(config.overflow, OverflowPolicy::Block { timeout_ms: 50 });
    }
}
