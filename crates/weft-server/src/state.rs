//! Abstract server machinery shared by the stream and datagram transports:
//! run/health flags, the registry, the unhealthy queue, the reaper loop, and
//! the send/disconnect surface working over registered connections.

use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tracing::{debug, error, trace, warn};

use weft_core::{
    ClientId, Config, ErrorKind, SharedBuffer, callbacks::SharableFactory, lock,
};

use crate::callbacks::ServerCallbackRegister;
use crate::registry::{ConnectionRegistry, UnhealthyQueue};

/// Object-safe view of a server, handed to callbacks and plugins and
/// implemented by both transport cores.
pub trait ServerApi: Send + Sync {
    /// Parses and validates `port`, binds, and starts the I/O worker, the
    /// reaper, and the callback pool. Fails without changing state.
    fn start(&self, port: &str) -> bool;
    /// Stops the server: joins workers, fires `on_stop_success`, clears the
    /// registry. Fails with `on_stop_error` when not running.
    fn stop(&self) -> bool;
    /// Flags the server unhealthy so its loops exit at the next quantum.
    /// The server stays `running` until `stop()` is called, letting a
    /// supervisor distinguish "asked to stop" from "fully stopped".
    fn request_stop(&self);
    /// True between a successful `start` and the end of `stop`.
    fn is_running(&self) -> bool;
    /// True while running and no fatal condition was observed.
    fn healthy(&self) -> bool;
    /// Human-readable alias for log lines.
    fn alias(&self) -> String;
    /// Replaces the alias.
    fn set_alias(&self, alias: &str);
    /// Address the server is bound to while running.
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Capacity used when building buffers for the `send_bytes` family.
    fn buffer_capacity(&self) -> usize;
    /// Number of registered connections.
    fn connection_count(&self) -> usize;
    /// Sends to a connection by id.
    fn send_to(&self, id: ClientId, buffer: &SharedBuffer, size: usize) -> bool;
    /// Sends to a connection by endpoint string.
    fn send_to_endpoint(&self, endpoint: &str, buffer: &SharedBuffer, size: usize) -> bool;
    /// Removes a connection by id, firing `on_disconnection`.
    fn disconnect(&self, id: ClientId) -> bool;
    /// Removes a connection by endpoint string.
    fn disconnect_endpoint(&self, endpoint: &str) -> bool;
    /// Access to the layered callback register.
    fn callbacks(&self) -> &ServerCallbackRegister;

    /// Sends a whole buffer by id.
    fn send_buffer_to(&self, id: ClientId, buffer: &SharedBuffer) -> bool {
        self.send_to(id, buffer, buffer.len())
    }

    /// Copies `data` into a fresh shared buffer and sends it by id.
    fn send_bytes_to(&self, id: ClientId, data: &[u8]) -> bool {
        let buffer = SharedBuffer::from_slice(data, self.buffer_capacity());
        self.send_to(id, &buffer, buffer.len())
    }

    /// Sends a UTF-8 string's bytes by id.
    fn send_string_to(&self, id: ClientId, text: &str) -> bool {
        self.send_bytes_to(id, text.as_bytes())
    }

    /// Copies `data` into a fresh shared buffer and sends it by endpoint.
    fn send_bytes_to_endpoint(&self, endpoint: &str, data: &[u8]) -> bool {
        let buffer = SharedBuffer::from_slice(data, self.buffer_capacity());
        self.send_to_endpoint(endpoint, &buffer, buffer.len())
    }

    /// Sends a UTF-8 string's bytes by endpoint.
    fn send_string_to_endpoint(&self, endpoint: &str, text: &str) -> bool {
        self.send_bytes_to_endpoint(endpoint, text.as_bytes())
    }
}

/// Shared handle to a server, usable from any callback thread.
pub type ServerHandle = Arc<dyn ServerApi>;

/// State common to both transport cores.
pub struct ServerState {
    /// Runtime configuration shared with connections and sockets.
    pub config: Config,
    alias: Mutex<String>,
    running: AtomicBool,
    healthy: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    /// The connection registry (id and endpoint keyed).
    pub registry: ConnectionRegistry,
    /// Queue of connections awaiting eviction by the reaper.
    pub unhealthy: Arc<UnhealthyQueue>,
    /// The layered callback register, shared with every connection.
    pub callbacks: Arc<ServerCallbackRegister>,
}

impl ServerState {
    /// Creates a stopped server state.
    pub fn new(config: Config, alias: String, sharable: SharableFactory<ServerHandle>) -> Self {
        Self {
            callbacks: Arc::new(ServerCallbackRegister::new(config.callback_workers, sharable)),
            config,
            alias: Mutex::new(alias),
            running: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            registry: ConnectionRegistry::new(),
            unhealthy: Arc::new(UnhealthyQueue::new()),
        }
    }

    /// Human-readable alias.
    pub fn alias(&self) -> String {
        lock(&self.alias).clone()
    }

    /// Replaces the alias.
    pub fn set_alias(&self, alias: &str) {
        let mut current = lock(&self.alias);
        debug!("set alias for server: {} to: {}", current, alias);
        *current = alias.to_string();
    }

    /// True between a successful `start` and the end of `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while running and no fatal condition was observed.
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.is_running()
    }

    pub(crate) fn set_run_status(&self, status: bool) {
        debug!("server {} is now {}", self.alias(), if status { "running" } else { "stopped" });
        self.running.store(status, Ordering::SeqCst);
    }

    /// Flips the health flag. Turning it off wakes the reaper so it can
    /// observe the change and exit.
    pub fn set_health_status(&self, status: bool) {
        debug!(
            "server {} health is now {}",
            self.alias(),
            if status { "healthy" } else { "unhealthy" }
        );
        self.healthy.store(status, Ordering::SeqCst);
        if !status {
            self.unhealthy.notify();
        }
    }

    /// Address the server is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub(crate) fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *lock(&self.local_addr) = addr;
    }

    /// Transitions into the running state: starts the callback pool, resets
    /// id allocation, raises both flags. Called under the control mutex.
    pub(crate) fn begin_start(&self) {
        trace!("starting server pool: {}", self.alias());
        self.callbacks.unsafe_start_pool();
        self.registry.reset_ids();
        self.set_run_status(true);
        self.set_health_status(true);
    }

    /// Final stop sequence after the workers have been joined: fires
    /// `on_stop_success`, stops the pool, clears the registry.
    pub(crate) fn finish_stop(&self) {
        self.callbacks.fire_stop_success();
        self.callbacks.unsafe_stop_pool();
        self.registry.clear();
        self.set_local_addr(None);
        trace!("stopped server pool: {}", self.alias());
    }

    /// The removal primitive: unregisters the connection (both map
    /// directions), stops it, and fires `on_disconnection`. A miss fires
    /// `on_disconnection_error(NotFound)` and returns false.
    pub fn remove_connection(&self, id: ClientId) -> bool {
        debug!("removing connection {} from server: {}", id, self.alias());
        match self.registry.remove(id) {
            Some(connection) => {
                connection.stop();
                self.callbacks.fire_disconnection(id);
                true
            }
            None => {
                error!(
                    "cannot remove a non-existing connection {} from server: {}",
                    id,
                    self.alias()
                );
                self.callbacks.fire_disconnection_error(ErrorKind::NotFound);
                false
            }
        }
    }

    /// Endpoint-keyed variant of the removal primitive.
    pub fn remove_connection_by_endpoint(&self, endpoint: &str) -> bool {
        debug!("removing connection {} from server: {}", endpoint, self.alias());
        match self.registry.remove_by_endpoint(endpoint) {
            Some((id, connection)) => {
                connection.stop();
                self.callbacks.fire_disconnection(id);
                true
            }
            None => {
                error!(
                    "cannot remove a non-existing connection {} from server: {}",
                    endpoint,
                    self.alias()
                );
                self.callbacks.fire_disconnection_error(ErrorKind::NotFound);
                false
            }
        }
    }

    /// Sends to a connection by id; a miss fires
    /// `on_send_error(NotConnected)` with no connection attached.
    pub fn send_to(&self, id: ClientId, buffer: &SharedBuffer, size: usize) -> bool {
        debug!("sending {} bytes to client {} from server: {}", size, id, self.alias());
        match self.registry.get(id) {
            Some(connection) => connection.send(buffer, size),
            None => {
                error!(
                    "cannot send data to a non-existing connection {} from server: {}",
                    id,
                    self.alias()
                );
                self.callbacks.fire_send_error(None, ErrorKind::NotConnected, 0);
                false
            }
        }
    }

    /// Sends to a connection by endpoint; a miss fires
    /// `on_send_error(NotFound)` with no connection attached.
    pub fn send_to_endpoint(&self, endpoint: &str, buffer: &SharedBuffer, size: usize) -> bool {
        debug!("sending {} bytes to client {} from server: {}", size, endpoint, self.alias());
        match self.registry.get_by_endpoint(endpoint) {
            Some(connection) => connection.send(buffer, size),
            None => {
                error!(
                    "cannot send data to a non-existing connection {} from server: {}",
                    endpoint,
                    self.alias()
                );
                self.callbacks.fire_send_error(None, ErrorKind::NotFound, size);
                false
            }
        }
    }
}

/// The reaper: waits until connections are flagged unhealthy or the server
/// itself turns unhealthy, drains the queue, evicts each flagged connection,
/// and exits once the server is unhealthy after draining.
pub(crate) fn reaper_loop(state: &ServerState) {
    trace!("starting unhealthy connections reaper for server: {}", state.alias());
    loop {
        let drained = state.unhealthy.wait_drain(|| !state.healthy());
        for id in drained {
            if state.healthy() {
                state.remove_connection(id);
            }
        }
        if !state.healthy() {
            break;
        }
    }
    trace!("stopping unhealthy connections reaper for server: {}", state.alias());
}

/// Joins a worker thread unless the caller *is* that thread (a callback
/// running on the worker may call `stop()` or `disconnect()` itself; the
/// loop already observes non-health and exits on its own).
pub(crate) fn join_worker(worker: Option<std::thread::JoinHandle<()>>) {
    if let Some(worker) = worker {
        if worker.thread().id() != std::thread::current().id() {
            if worker.join().is_err() {
                warn!("server worker thread panicked during join");
            }
        }
    }
}
