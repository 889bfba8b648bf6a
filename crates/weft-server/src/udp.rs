//! Datagram (UDP) server and its per-peer connection.
//!
//! A single socket is shared by every peer: the I/O worker performs one
//! `recv_from` per quantum, resolves the source endpoint against the
//! registry, and registers a new connection on first contact. The
//! lookup-then-insert runs atomically under the registry mutex, so
//! concurrent datagrams from one endpoint produce exactly one connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use socket2::SockRef;
use tracing::{debug, error, trace, warn};

use weft_core::{
    ClientId, Config, ErrorKind, Severity, SharedBuffer,
    callbacks::SharableFactory,
    error::is_quantum_idle,
    lock,
    socket::apply_socket_options,
};
use weft_utilities::{format_endpoint, parse_port};

use crate::callbacks::ServerCallbackRegister;
use crate::connection::{ConnectionApi, ConnectionHandle, ConnectionState};
use crate::state::{ServerApi, ServerHandle, ServerState, join_worker, reaper_loop};

pub(crate) struct UdpSendOp {
    connection: Arc<UdpConnection>,
    buffer: SharedBuffer,
    size: usize,
}

/// Server-side datagram connection. Holds the peer endpoint; the socket is
/// shared with the server, so `stop()` only flips the state flags.
pub struct UdpConnection {
    state: ConnectionState,
    peer: SocketAddr,
    op_tx: Sender<UdpSendOp>,
    self_ref: Weak<UdpConnection>,
}

impl UdpConnection {
    fn make(
        peer: SocketAddr,
        endpoint: String,
        callbacks: Arc<ServerCallbackRegister>,
        notify_connection_unhealthy: crate::connection::ConnectionUnhealthyNotifier,
        notify_server_unhealthy: crate::connection::ServerUnhealthyNotifier,
        capacity: usize,
        op_tx: Sender<UdpSendOp>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: ConnectionState::new(
                endpoint,
                callbacks,
                notify_connection_unhealthy,
                notify_server_unhealthy,
                capacity,
            ),
            peer,
            op_tx,
            self_ref: weak.clone(),
        })
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        self.self_ref.upgrade().map(|connection| connection as ConnectionHandle)
    }

    /// The peer this connection stands for.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn complete_send(&self, result: io::Result<usize>) {
        self.state.complete_send(self.handle(), result);
    }
}

impl ConnectionApi for UdpConnection {
    fn id(&self) -> ClientId {
        self.state.id()
    }

    fn assign_id(&self, id: ClientId) {
        self.state.assign_id(id);
    }

    fn endpoint(&self) -> &str {
        self.state.endpoint()
    }

    fn alias(&self) -> String {
        self.state.alias()
    }

    fn set_alias(&self, alias: &str) {
        self.state.set_alias(alias);
    }

    fn connected(&self) -> bool {
        self.state.connected()
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn healthy(&self) -> bool {
        self.state.healthy()
    }

    fn buffer_capacity(&self) -> usize {
        self.state.buffer_capacity()
    }

    fn send(&self, buffer: &SharedBuffer, size: usize) -> bool {
        let Some(connection) = self.handle() else { return false };
        trace!("preparing to send {} bytes to: {}", size, self.alias());
        if !self.state.validate_send(&connection, buffer, size) {
            return false;
        }
        let Some(typed) = self.self_ref.upgrade() else { return false };
        let queued = self
            .op_tx
            .send(UdpSendOp { connection: typed, buffer: buffer.clone(), size })
            .is_ok();
        if !queued {
            self.state.callbacks.fire_send_error(Some(connection), ErrorKind::NotConnected, 0);
        }
        queued
    }

    fn stop(&self) -> bool {
        if !self.is_running() {
            warn!("connection already stopped: {}", self.alias());
            return false;
        }
        debug!("stopping connection: {}", self.alias());
        // The socket belongs to the server; only the flags change here.
        self.state.set_run_status(false);
        self.state.set_health_status(false);
        true
    }

    fn poll_receive(&self) {
        // Receives for datagram peers arrive through the server socket.
    }
}

struct UdpControl {
    io_worker: Option<thread::JoinHandle<()>>,
    reaper: Option<thread::JoinHandle<()>>,
    op_tx: Option<Sender<UdpSendOp>>,
}

/// Datagram server core: one shared socket plus the registry, reaper, and
/// callback machinery of [`ServerState`].
pub struct UdpServerCore {
    state: ServerState,
    control: Mutex<UdpControl>,
    self_ref: Weak<UdpServerCore>,
}

impl UdpServerCore {
    /// Creates a stopped datagram server core.
    pub fn make(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<UdpServerCore>| {
            let sharable: SharableFactory<ServerHandle> = {
                let weak = weak.clone();
                Box::new(move || weak.upgrade().map(|core| core as ServerHandle))
            };
            UdpServerCore {
                state: ServerState::new(config, "udp_server".to_string(), sharable),
                control: Mutex::new(UdpControl { io_worker: None, reaper: None, op_tx: None }),
                self_ref: weak.clone(),
            }
        })
    }

    /// The shared abstract-server state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    fn open_socket(&self, port: u16) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_read_timeout(Some(self.state.config.poll_interval))?;
        apply_socket_options(SockRef::from(&socket), &self.state.config)?;
        Ok(socket)
    }

    /// Resolves the source endpoint to a connection, registering a new one
    /// atomically on first contact. Returns the connection and whether it
    /// was just inserted.
    fn connection_for(
        &self,
        peer: SocketAddr,
        op_tx: &Sender<UdpSendOp>,
    ) -> (ConnectionHandle, bool) {
        let endpoint = format_endpoint(&peer);
        self.state.registry.get_or_insert_with(&endpoint, || {
            let queue = self.state.unhealthy.clone();
            let server_ref = self.self_ref.clone();
            UdpConnection::make(
                peer,
                endpoint.clone(),
                self.state.callbacks.clone(),
                Box::new(move |id| queue.push(id)),
                Box::new(move || {
                    if let Some(core) = server_ref.upgrade() {
                        core.state.set_health_status(false);
                    }
                }),
                self.state.config.buffer_capacity,
                op_tx.clone(),
            ) as ConnectionHandle
        })
    }
}

impl ServerApi for UdpServerCore {
    fn start(&self, port: &str) -> bool {
        let mut control = lock(&self.control);

        debug!("starting server: {} on 0.0.0.0:{}", self.state.alias(), port);

        let port = match parse_port(port) {
            Ok(port) => port,
            Err(cause) => {
                error!("invalid port given to server {}: {}", self.state.alias(), cause);
                return false;
            }
        };
        if self.is_running() {
            error!("server already started: {}", self.state.alias());
            return false;
        }
        if let Err(bad) = self.state.config.validate() {
            error!("invalid configuration for server {}: {}", self.state.alias(), bad);
            return false;
        }

        let socket = match self.open_socket(port) {
            Ok(socket) => socket,
            Err(cause) => {
                error!("failed to open socket for {}: {}", self.state.alias(), cause);
                return false;
            }
        };
        let local_addr = socket.local_addr().ok();

        let Some(core) = self.self_ref.upgrade() else { return false };

        self.state.begin_start();
        self.state.set_local_addr(local_addr);

        let (op_tx, op_rx) = unbounded();
        control.op_tx = Some(op_tx.clone());

        let io_core = core.clone();
        control.io_worker = Some(
            thread::Builder::new()
                .name("weft-udp-server-io".to_string())
                .spawn(move || io_loop(io_core, socket, op_rx, op_tx))
                .expect("failed to spawn server io worker"),
        );
        control.reaper = Some(
            thread::Builder::new()
                .name("weft-server-reaper".to_string())
                .spawn(move || reaper_loop(&core.state))
                .expect("failed to spawn server reaper"),
        );

        self.state.callbacks.fire_start_success();
        debug!("server ready: {} on 0.0.0.0:{}", self.state.alias(), port);
        true
    }

    fn stop(&self) -> bool {
        let mut control = lock(&self.control);

        debug!("stopping server: {}", self.state.alias());

        if !self.is_running() {
            warn!("tried to stop already stopped server: {}", self.state.alias());
            self.state.callbacks.fire_stop_error(ErrorKind::NotConnected);
            return false;
        }

        self.state.set_run_status(false);
        self.state.set_health_status(false);
        control.op_tx = None;

        join_worker(control.io_worker.take());
        self.state.unhealthy.notify();
        join_worker(control.reaper.take());

        self.state.finish_stop();
        debug!("stopped server: {}", self.state.alias());
        true
    }

    fn request_stop(&self) {
        self.state.set_health_status(false);
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn healthy(&self) -> bool {
        self.state.healthy()
    }

    fn alias(&self) -> String {
        self.state.alias()
    }

    fn set_alias(&self, alias: &str) {
        self.state.set_alias(alias);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    fn buffer_capacity(&self) -> usize {
        self.state.config.buffer_capacity
    }

    fn connection_count(&self) -> usize {
        self.state.registry.len()
    }

    fn send_to(&self, id: ClientId, buffer: &SharedBuffer, size: usize) -> bool {
        self.state.send_to(id, buffer, size)
    }

    fn send_to_endpoint(&self, endpoint: &str, buffer: &SharedBuffer, size: usize) -> bool {
        self.state.send_to_endpoint(endpoint, buffer, size)
    }

    fn disconnect(&self, id: ClientId) -> bool {
        self.state.remove_connection(id)
    }

    fn disconnect_endpoint(&self, endpoint: &str) -> bool {
        self.state.remove_connection_by_endpoint(endpoint)
    }

    fn callbacks(&self) -> &ServerCallbackRegister {
        &self.state.callbacks
    }
}

/// One iteration per quantum: drain queued sends, then perform at most one
/// `recv_from`. The socket read timeout paces the loop.
fn io_loop(
    core: Arc<UdpServerCore>,
    socket: UdpSocket,
    ops: Receiver<UdpSendOp>,
    op_tx: Sender<UdpSendOp>,
) {
    trace!("starting io worker for server: {}", core.state.alias());
    let mut receive_buffer = vec![0u8; core.state.config.buffer_capacity];

    while core.state.healthy() {
        while let Ok(op) = ops.try_recv() {
            let result = socket.send_to(&op.buffer.as_slice()[..op.size], op.connection.peer());
            op.connection.complete_send(result);
        }
        if !core.state.healthy() {
            break;
        }

        match socket.recv_from(&mut receive_buffer) {
            Ok((received, peer)) => {
                let (connection, inserted) = core.connection_for(peer, &op_tx);
                if inserted {
                    debug!(
                        "connected new client {} to server: {}",
                        connection.id(),
                        core.state.alias()
                    );
                    core.state.callbacks.fire_connection(connection.clone());
                }
                debug!(
                    "received {} bytes from client {} for server: {}",
                    received,
                    connection.id(),
                    core.state.alias()
                );
                let copy = SharedBuffer::from_slice(
                    &receive_buffer[..received],
                    core.state.config.buffer_capacity,
                );
                core.state.callbacks.fire_receive(connection, copy, received);
            }
            Err(idle) if is_quantum_idle(&idle) => {}
            Err(cause) => {
                let cause = ErrorKind::from(cause);
                warn!("error on receive for server {}: {}", core.state.alias(), cause);
                if cause.severity() != Severity::Transient {
                    error!(
                        "server {} cannot receive due to {}, server is not healthy",
                        core.state.alias(),
                        cause
                    );
                    core.state.set_health_status(false);
                }
                core.state.callbacks.fire_receive_error(
                    None,
                    SharedBuffer::empty(),
                    cause,
                    0,
                );
            }
        }
    }

    trace!("stopping io worker for server: {}", core.state.alias());
    // Dropping the socket here closes it.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_bad_ports() {
        let server = UdpServerCore::make(Config::default());
        assert!(!server.start("70000"));
        assert!(!server.is_running());
    }

    #[test]
    fn start_stop_round_trip() {
        let server = UdpServerCore::make(Config::default());
        assert!(server.start("0"));
        assert!(server.healthy());
        assert!(server.local_addr().is_some());
        assert!(server.stop());
        assert!(!server.stop());
    }

    #[test]
    fn datagram_connection_stop_flips_flags_only() {
        let server = UdpServerCore::make(Config::default());
        assert!(server.start("0"));
        let addr = server.local_addr().unwrap();

        // First contact registers a connection.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.send_to(b"hi", ("127.0.0.1", addr.port())).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while server.connection_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(server.connection_count(), 1);

        let connection = server.state().registry.connections().pop().unwrap();
        assert!(connection.healthy());
        assert!(connection.stop());
        assert!(!connection.is_running());
        assert!(!connection.stop()); // idempotent, reports false

        server.stop();
    }
}
