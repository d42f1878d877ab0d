//! Concurrent map of live connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;

use crate::entity::{EntityHandle, EntityState};
use crate::guid::ConnectionId;

/// Errors returned by [`EntityRegistry::add`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The identity is already registered.
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
    /// The registry holds its maximum number of entries.
    #[error("connection limit of {max} reached")]
    Full {
        /// The configured limit.
        max: usize,
    },
}

/// Thread-safe map from [`ConnectionId`] to [`EntityHandle`].
///
/// Readers (routing, broadcast) share the lock; add and remove are exclusive.
/// An identity is present while its connection is `Open` or `Closing` and is
/// removed exactly once by the close path that owns the socket.
pub struct EntityRegistry {
    inner: RwLock<HashMap<ConnectionId, EntityHandle>>,
    max_entries: AtomicUsize,
    emptied: Notify,
}

impl EntityRegistry {
    /// Create a registry that holds at most `max_entries` connections.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_entries: AtomicUsize::new(max_entries),
            emptied: Notify::new(),
        }
    }

    /// Change the connection limit. Existing entries are kept.
    pub fn set_max_entries(&self, max_entries: usize) {
        self.max_entries.store(max_entries, Ordering::Relaxed);
    }

    /// Current connection limit.
    pub fn max_entries(&self) -> usize {
        self.max_entries.load(Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, EntityHandle>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, EntityHandle>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    pub fn add(&self, handle: EntityHandle) -> Result<(), RegistryError> {
        let mut map = self.write();
        let max = self.max_entries();
        if map.contains_key(&handle.id()) {
            return Err(RegistryError::Duplicate(handle.id()));
        }
        if map.len() >= max {
            return Err(RegistryError::Full { max });
        }
        map.insert(handle.id(), handle);
        Ok(())
    }

    /// Unregister a connection. Returns the handle if it was present.
    pub fn remove(&self, id: ConnectionId) -> Option<EntityHandle> {
        let mut map = self.write();
        let removed = map.remove(&id);
        let now_empty = map.is_empty();
        drop(map);

        if removed.is_some() && now_empty {
            self.emptied.notify_waiters();
        }
        removed
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnectionId) -> Option<EntityHandle> {
        self.read().get(&id).cloned()
    }

    /// Whether `id` is registered and `Open`.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.read().get(&id).is_some_and(EntityHandle::is_open)
    }

    /// Visit every `Open` connection under the read lock.
    ///
    /// Entries that move to `Closing` during the walk are skipped. `visit`
    /// must not call back into `add` or `remove`.
    pub fn for_each_open<F: FnMut(&EntityHandle)>(&self, mut visit: F) {
        for handle in self.read().values() {
            if handle.is_open() {
                visit(handle);
            }
        }
    }

    /// Clone out every `Open` handle, for sends that run without the lock.
    pub fn snapshot_open(&self) -> Vec<EntityHandle> {
        let mut out = Vec::new();
        self.for_each_open(|handle| out.push(handle.clone()));
        out
    }

    /// Number of `Open` connections.
    pub fn count_open(&self) -> usize {
        self.read().values().filter(|h| h.state() == EntityState::Open).count()
    }

    /// Number of registered connections, including those closing.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Any one registered connection. Used by the client role, which holds
    /// at most one.
    pub fn any(&self) -> Option<EntityHandle> {
        self.read().values().next().cloned()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<EntityHandle> {
        let drained: Vec<_> = self.write().drain().map(|(_, h)| h).collect();
        self.emptied.notify_waiters();
        drained
    }

    /// Resolve once the registry is empty.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
