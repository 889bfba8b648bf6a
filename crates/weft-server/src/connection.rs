//! Per-peer connection state shared by the stream and datagram transports.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::{debug, error, warn};

use weft_core::{ClientId, ErrorKind, INVALID_CLIENT_ID, Severity, SharedBuffer, lock};

use crate::callbacks::ServerCallbackRegister;

/// Notifier a connection uses to ask the server to evict it.
pub type ConnectionUnhealthyNotifier = Box<dyn Fn(ClientId) + Send + Sync>;
/// Notifier a connection uses to flag the whole server unhealthy.
pub type ServerUnhealthyNotifier = Box<dyn Fn() + Send + Sync>;

/// Object-safe view of a server-side connection, handed to callbacks.
pub trait ConnectionApi: Send + Sync {
    /// The id assigned at registration; `INVALID_CLIENT_ID` before that.
    fn id(&self) -> ClientId;
    /// Assigns the registry id. Called once, by the registry.
    fn assign_id(&self, id: ClientId);
    /// Canonical `ip:port` of the peer; the registry's secondary key.
    fn endpoint(&self) -> &str;
    /// Human-readable alias for log lines.
    fn alias(&self) -> String;
    /// Replaces the alias.
    fn set_alias(&self, alias: &str);
    /// True once an id has been assigned.
    fn connected(&self) -> bool;
    /// True while the connection's run flag is up and it is connected.
    fn is_running(&self) -> bool;
    /// True while running and no fatal error was observed.
    fn healthy(&self) -> bool;
    /// Capacity used when building buffers for the `send_bytes` family.
    fn buffer_capacity(&self) -> usize;
    /// Sends `size` bytes out of `buffer`; completion is asynchronous.
    fn send(&self, buffer: &SharedBuffer, size: usize) -> bool;
    /// Stops the connection. Idempotent; returns false when already stopped.
    fn stop(&self) -> bool;
    /// Drives one receive quantum. Called only from the server's I/O worker;
    /// a no-op for datagram connections, whose receives arrive through the
    /// server socket.
    fn poll_receive(&self);

    /// Sends a whole buffer.
    fn send_buffer(&self, buffer: &SharedBuffer) -> bool {
        self.send(buffer, buffer.len())
    }

    /// Copies `data` into a fresh shared buffer and sends it.
    fn send_bytes(&self, data: &[u8]) -> bool {
        let buffer = SharedBuffer::from_slice(data, self.buffer_capacity());
        self.send(&buffer, buffer.len())
    }

    /// Sends a UTF-8 string's bytes.
    fn send_string(&self, text: &str) -> bool {
        self.send_bytes(text.as_bytes())
    }
}

/// Shared handle to a connection, usable from any callback thread.
pub type ConnectionHandle = Arc<dyn ConnectionApi>;

/// State common to stream and datagram connections: identity, health flags,
/// the parent's callback register, and the two unhealthy notifiers that form
/// the weak back-reference to the server.
pub struct ConnectionState {
    id: AtomicU64,
    alias: Mutex<String>,
    endpoint: String,
    running: AtomicBool,
    healthy: AtomicBool,
    buffer_capacity: usize,
    pub(crate) callbacks: Arc<ServerCallbackRegister>,
    notify_connection_unhealthy: ConnectionUnhealthyNotifier,
    notify_server_unhealthy: ServerUnhealthyNotifier,
}

impl ConnectionState {
    /// Creates the state for a freshly accepted peer: running and healthy,
    /// id still invalid until the registry assigns one.
    pub(crate) fn new(
        endpoint: String,
        callbacks: Arc<ServerCallbackRegister>,
        notify_connection_unhealthy: ConnectionUnhealthyNotifier,
        notify_server_unhealthy: ServerUnhealthyNotifier,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            id: AtomicU64::new(INVALID_CLIENT_ID),
            alias: Mutex::new(format!("connection({})", endpoint)),
            endpoint,
            running: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            buffer_capacity,
            callbacks,
            notify_connection_unhealthy,
            notify_server_unhealthy,
        }
    }

    pub(crate) fn id(&self) -> ClientId {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn assign_id(&self, id: ClientId) {
        debug!("set id for connection {} to {}", self.alias(), id);
        self.id.store(id, Ordering::SeqCst);
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn alias(&self) -> String {
        lock(&self.alias).clone()
    }

    pub(crate) fn set_alias(&self, alias: &str) {
        let mut current = lock(&self.alias);
        debug!("set alias for connection: {} to: {}", current, alias);
        *current = alias.to_string();
    }

    pub(crate) fn connected(&self) -> bool {
        self.id() != INVALID_CLIENT_ID
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.connected()
    }

    pub(crate) fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.is_running()
    }

    pub(crate) fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) fn set_run_status(&self, status: bool) {
        debug!("set run status for connection {} to {}", self.alias(), status);
        self.running.store(status, Ordering::SeqCst);
    }

    pub(crate) fn set_health_status(&self, status: bool) {
        debug!("set health status for connection {} to {}", self.alias(), status);
        self.healthy.store(status, Ordering::SeqCst);
    }

    /// Routes a classified error to the right notifier: connection-fatal
    /// flags this connection for eviction, server-fatal flags the server.
    pub(crate) fn escalate(&self, error: &ErrorKind) {
        match error.severity() {
            Severity::ConnectionFatal => {
                error!(
                    "connection {} is not healthy due to {}, flagging for eviction",
                    self.alias(),
                    error
                );
                self.set_health_status(false);
                (self.notify_connection_unhealthy)(self.id());
            }
            Severity::ServerFatal => {
                error!(
                    "server flagged unhealthy by connection {} due to {}",
                    self.alias(),
                    error
                );
                (self.notify_server_unhealthy)();
            }
            Severity::Transient => {}
        }
    }

    /// Shared send-completion path: fires `on_sent` or `on_send_error` and
    /// escalates fatal errors.
    pub(crate) fn complete_send(
        &self,
        connection: Option<ConnectionHandle>,
        result: std::io::Result<usize>,
    ) {
        match result {
            Ok(sent) => {
                debug!("sent {} bytes to connection: {}", sent, self.alias());
                if let Some(connection) = connection {
                    self.callbacks.fire_sent(connection, sent);
                }
            }
            Err(cause) => {
                let cause = ErrorKind::from(cause);
                warn!("error on send to connection {}: {}", self.alias(), cause);
                self.callbacks.fire_send_error(connection, cause.clone(), 0);
                self.escalate(&cause);
            }
        }
    }

    /// Shared send validation: fires the matching `on_send_error` and
    /// returns false on any violation.
    pub(crate) fn validate_send(
        &self,
        connection: &ConnectionHandle,
        buffer: &SharedBuffer,
        size: usize,
    ) -> bool {
        if !self.healthy() {
            error!("cannot send data to a non-healthy connection: {}", self.alias());
            self.callbacks.fire_send_error(Some(connection.clone()), ErrorKind::NotConnected, 0);
            return false;
        }
        if size == 0 {
            error!("cannot send 0 bytes to connection: {}", self.alias());
            self.callbacks.fire_send_error(Some(connection.clone()), ErrorKind::EmptySend, 0);
            return false;
        }
        if size > buffer.len() {
            error!(
                "cannot send more than the buffer length of {} bytes to connection: {}",
                buffer.len(),
                self.alias()
            );
            self.callbacks.fire_send_error(
                Some(connection.clone()),
                ErrorKind::OversizedSend { requested: size, available: buffer.len() },
                0,
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use weft_core::callbacks::SharableFactory;

    use super::*;
    use crate::state::ServerHandle;

    fn test_state(capacity: usize) -> (ConnectionState, Arc<std::sync::atomic::AtomicUsize>) {
        let flagged = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = flagged.clone();
        let sharable: SharableFactory<ServerHandle> = Box::new(|| None);
        let callbacks = Arc::new(ServerCallbackRegister::new(1, sharable));
        let state = ConnectionState::new(
            "127.0.0.1:9000".to_string(),
            callbacks,
            Box::new(move |_id| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|| {}),
            capacity,
        );
        (state, flagged)
    }

    #[test]
    fn health_chain_requires_id_assignment() {
        let (state, _) = test_state(1024);
        // Running and healthy flags are up, but no id yet.
        assert!(!state.connected());
        assert!(!state.is_running());
        assert!(!state.healthy());

        state.assign_id(0);
        assert!(state.connected());
        assert!(state.is_running());
        assert!(state.healthy());
    }

    #[test]
    fn health_chain_is_strict() {
        let (state, _) = test_state(1024);
        state.assign_id(3);
        state.set_health_status(false);
        assert!(state.is_running());
        assert!(!state.healthy());

        state.set_health_status(true);
        state.set_run_status(false);
        assert!(state.connected());
        assert!(!state.is_running());
        assert!(!state.healthy());
    }

    #[test]
    fn connection_fatal_errors_notify_the_queue() {
        let (state, flagged) = test_state(1024);
        state.assign_id(1);
        state.escalate(&ErrorKind::NotConnected);
        assert!(!state.healthy());
        assert_eq!(flagged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_errors_do_not_escalate() {
        let (state, flagged) = test_state(1024);
        state.assign_id(1);
        state.escalate(&ErrorKind::EmptySend);
        assert!(state.healthy());
        assert_eq!(flagged.load(Ordering::SeqCst), 0);
    }
}
