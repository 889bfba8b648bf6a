//! Connection registry and unhealthy-connection queue.
//!
//! The registry keeps three maps consistent under one mutex: id to
//! connection, id to endpoint, and endpoint to id. Id allocation is
//! monotonic; past the sentinel it wraps and searches linearly for the next
//! free id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use weft_core::{BASE_CLIENT_ID, ClientId, INVALID_CLIENT_ID, lock};

use crate::connection::ConnectionHandle;

struct RegistryInner {
    connections: HashMap<ClientId, ConnectionHandle>,
    id_to_endpoint: HashMap<ClientId, String>,
    endpoint_to_id: HashMap<String, ClientId>,
    next_id: ClientId,
}

/// Two-way mapping `ClientId <-> endpoint` plus `ClientId -> connection`.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: HashMap::new(),
                id_to_endpoint: HashMap::new(),
                endpoint_to_id: HashMap::new(),
                next_id: BASE_CLIENT_ID,
            }),
        }
    }

    /// Restarts id allocation from the base id. Called on server start.
    pub fn reset_ids(&self) {
        lock(&self.inner).next_id = BASE_CLIENT_ID;
    }

    fn allocate_id(inner: &mut RegistryInner) -> ClientId {
        loop {
            while inner.connections.contains_key(&inner.next_id) {
                inner.next_id = inner.next_id.wrapping_add(1);
            }
            if inner.next_id == INVALID_CLIENT_ID {
                inner.next_id = inner.next_id.wrapping_add(1);
                continue;
            }
            break;
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        id
    }

    fn insert_locked(inner: &mut RegistryInner, connection: ConnectionHandle) -> ClientId {
        let id = Self::allocate_id(inner);
        let endpoint = connection.endpoint().to_string();
        connection.set_alias(&endpoint);
        connection.assign_id(id);
        inner.connections.insert(id, connection);
        inner.id_to_endpoint.insert(id, endpoint.clone());
        inner.endpoint_to_id.insert(endpoint, id);
        id
    }

    /// Registers a connection: assigns the next free id, aliases the
    /// connection by its endpoint, and records both map directions.
    pub fn insert(&self, connection: ConnectionHandle) -> ClientId {
        Self::insert_locked(&mut lock(&self.inner), connection)
    }

    /// Atomic lookup-then-insert keyed by endpoint: returns the existing
    /// connection, or builds and registers a new one under the same lock.
    /// The boolean is true when a new connection was inserted.
    pub fn get_or_insert_with(
        &self,
        endpoint: &str,
        make: impl FnOnce() -> ConnectionHandle,
    ) -> (ConnectionHandle, bool) {
        let mut inner = lock(&self.inner);
        if let Some(id) = inner.endpoint_to_id.get(endpoint).copied() {
            if let Some(existing) = inner.connections.get(&id) {
                return (existing.clone(), false);
            }
        }
        let connection = make();
        Self::insert_locked(&mut inner, connection.clone());
        (connection, true)
    }

    /// Looks a connection up by id. The sentinel id never matches.
    pub fn get(&self, id: ClientId) -> Option<ConnectionHandle> {
        if id == INVALID_CLIENT_ID {
            return None;
        }
        lock(&self.inner).connections.get(&id).cloned()
    }

    /// Looks a connection up by endpoint string.
    pub fn get_by_endpoint(&self, endpoint: &str) -> Option<ConnectionHandle> {
        let inner = lock(&self.inner);
        let id = inner.endpoint_to_id.get(endpoint)?;
        inner.connections.get(id).cloned()
    }

    /// Removes by id, erasing both map directions.
    pub fn remove(&self, id: ClientId) -> Option<ConnectionHandle> {
        let mut inner = lock(&self.inner);
        let connection = inner.connections.remove(&id)?;
        if let Some(endpoint) = inner.id_to_endpoint.remove(&id) {
            inner.endpoint_to_id.remove(&endpoint);
        }
        Some(connection)
    }

    /// Removes by endpoint, erasing both map directions.
    pub fn remove_by_endpoint(&self, endpoint: &str) -> Option<(ClientId, ConnectionHandle)> {
        let mut inner = lock(&self.inner);
        let id = inner.endpoint_to_id.remove(endpoint)?;
        inner.id_to_endpoint.remove(&id);
        let connection = inner.connections.remove(&id)?;
        Some((id, connection))
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        lock(&self.inner).connections.values().cloned().collect()
    }

    /// Snapshot of the live ids.
    pub fn ids(&self) -> Vec<ClientId> {
        lock(&self.inner).connections.keys().copied().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        lock(&self.inner).connections.len()
    }

    /// True when no connection is registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).connections.is_empty()
    }

    /// Empties the registry, stopping every removed connection. No
    /// disconnection event fires; this is the teardown path.
    pub fn clear(&self) {
        let removed: Vec<ConnectionHandle> = {
            let mut inner = lock(&self.inner);
            inner.id_to_endpoint.clear();
            inner.endpoint_to_id.clear();
            inner.connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in removed {
            connection.stop();
        }
    }
}

/// FIFO of connections awaiting eviction, drained by the reaper.
pub struct UnhealthyQueue {
    queue: Mutex<VecDeque<ClientId>>,
    available: Condvar,
}

impl Default for UnhealthyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UnhealthyQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }

    /// Enqueues a connection id and wakes the reaper.
    pub fn push(&self, id: ClientId) {
        lock(&self.queue).push_back(id);
        self.available.notify_all();
    }

    /// Wakes the reaper without enqueuing, so it can observe `should_wake`
    /// (used when the server turns unhealthy).
    pub fn notify(&self) {
        let _guard = lock(&self.queue);
        self.available.notify_all();
    }

    /// Blocks until the queue is non-empty or `should_wake` returns true,
    /// then drains and returns the queued ids. The queue mutex is released
    /// before the caller touches the registry.
    pub fn wait_drain(&self, should_wake: impl Fn() -> bool) -> Vec<ClientId> {
        let mut queue = lock(&self.queue);
        while queue.is_empty() && !should_wake() {
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        queue.drain(..).collect()
    }
}
