//! Stream (TCP) server and its per-peer connection.
//!
//! The acceptor is non-blocking; accepted sockets stay blocking with a read
//! timeout of one poll quantum, so the single I/O worker makes a bounded
//! pass over accept, queued sends, and per-connection receives each
//! iteration and observes health changes within a quantum.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use socket2::{Domain, SockRef, Socket, Type};
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

pub(crate) struct TcpSendOp {
    connection: Arc<TcpConnection>,
    buffer: SharedBuffer,
    size: usize,
}

/// Server-side stream connection. Owns its socket; receives are pumped by
/// the server's I/O worker, sends are queued onto the server's op channel.
pub struct TcpConnection {
    state: ConnectionState,
    socket: TcpStream,
    receive_buffer: Mutex<Vec<u8>>,
    op_tx: Sender<TcpSendOp>,
    self_ref: Weak<TcpConnection>,
}

impl TcpConnection {
    fn make(
        socket: TcpStream,
        endpoint: String,
        callbacks: Arc<ServerCallbackRegister>,
        notify_connection_unhealthy: crate::connection::ConnectionUnhealthyNotifier,
        notify_server_unhealthy: crate::connection::ServerUnhealthyNotifier,
        capacity: usize,
        op_tx: Sender<TcpSendOp>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: ConnectionState::new(
                endpoint,
                callbacks,
                notify_connection_unhealthy,
                notify_server_unhealthy,
                capacity,
            ),
            socket,
            receive_buffer: Mutex::new(vec![0u8; capacity]),
            op_tx,
            self_ref: weak.clone(),
        })
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        self.self_ref.upgrade().map(|connection| connection as ConnectionHandle)
    }

    /// Performs the queued socket write and fires the completion events.
    /// Runs on the server's I/O worker.
    fn perform_send(&self, buffer: &SharedBuffer, size: usize) {
        let result = {
            let mut writer: &TcpStream = &self.socket;
            writer.write_all(&buffer.as_slice()[..size]).map(|_| size)
        };
        self.state.complete_send(self.handle(), result);
    }
}

impl ConnectionApi for TcpConnection {
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
            .send(TcpSendOp { connection: typed, buffer: buffer.clone(), size })
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
        trace!("stopping connection: {}", self.alias());
        self.state.set_run_status(false);
        self.state.set_health_status(false);
        let _ = self.socket.shutdown(Shutdown::Both);
        true
    }

    fn poll_receive(&self) {
        if !self.healthy() {
            return;
        }
        let Some(connection) = self.handle() else { return };

        let mut buffer = lock(&self.receive_buffer);
        let mut reader: &TcpStream = &self.socket;
        let outcome = match reader.read(&mut buffer) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")),
            other => other,
        };
        match outcome {
            Ok(received) => {
                debug!("received {} bytes from connection: {}", received, self.alias());
                let copy =
                    SharedBuffer::from_slice(&buffer[..received], self.state.buffer_capacity());
                drop(buffer);
                self.state.callbacks.fire_receive(connection, copy, received);
            }
            Err(idle) if is_quantum_idle(&idle) => {}
            Err(cause) => {
                drop(buffer);
                let cause = ErrorKind::from(cause);
                warn!("error on receive for connection {}: {}", self.alias(), cause);
                self.state.escalate(&cause);
                self.state.callbacks.fire_receive_error(
                    Some(connection),
                    SharedBuffer::empty(),
                    cause,
                    0,
                );
            }
        }
    }
}

struct TcpControl {
    io_worker: Option<thread::JoinHandle<()>>,
    reaper: Option<thread::JoinHandle<()>>,
    op_tx: Option<Sender<TcpSendOp>>,
}

/// Stream server core: non-blocking acceptor plus the registry, reaper, and
/// callback machinery of [`ServerState`].
pub struct TcpServerCore {
    state: ServerState,
    control: Mutex<TcpControl>,
    self_ref: Weak<TcpServerCore>,
}

impl TcpServerCore {
    /// Creates a stopped stream server core.
    pub fn make(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TcpServerCore>| {
            let sharable: SharableFactory<ServerHandle> = {
                let weak = weak.clone();
                Box::new(move || weak.upgrade().map(|core| core as ServerHandle))
            };
            TcpServerCore {
                state: ServerState::new(config, "tcp_server".to_string(), sharable),
                control: Mutex::new(TcpControl { io_worker: None, reaper: None, op_tx: None }),
                self_ref: weak.clone(),
            }
        })
    }

    /// The shared abstract-server state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    fn open_listener(&self, port: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        apply_socket_options(SockRef::from(&socket), &self.state.config)?;
        let endpoint = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&endpoint.into())?;
        socket.listen(self.state.config.accept_backlog as i32)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Registers an accepted socket and fires `on_connection`. Runs on the
    /// I/O worker.
    fn accept(&self, socket: TcpStream, peer: SocketAddr, op_tx: &Sender<TcpSendOp>) {
        debug!("accepted connection for server: {}", self.state.alias());
        if let Err(cause) = socket.set_read_timeout(Some(self.state.config.poll_interval)) {
            self.state.callbacks.fire_connection_error(ErrorKind::from(cause));
            return;
        }
        if let Err(cause) = apply_socket_options(SockRef::from(&socket), &self.state.config) {
            self.state.callbacks.fire_connection_error(ErrorKind::from(cause));
            return;
        }

        let queue = self.state.unhealthy.clone();
        let server_ref = self.self_ref.clone();
        let connection = TcpConnection::make(
            socket,
            format_endpoint(&peer),
            self.state.callbacks.clone(),
            Box::new(move |id| queue.push(id)),
            Box::new(move || {
                if let Some(core) = server_ref.upgrade() {
                    core.state.set_health_status(false);
                }
            }),
            self.state.config.buffer_capacity,
            op_tx.clone(),
        );

        let handle = connection as ConnectionHandle;
        self.state.registry.insert(handle.clone());
        self.state.callbacks.fire_connection(handle);
    }
}

impl ServerApi for TcpServerCore {
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

        let listener = match self.open_listener(port) {
            Ok(listener) => listener,
            Err(cause) => {
                error!("failed to open acceptor for {}: {}", self.state.alias(), cause);
                return false;
            }
        };
        let local_addr = listener.local_addr().ok();

        let Some(core) = self.self_ref.upgrade() else { return false };

        self.state.begin_start();
        self.state.set_local_addr(local_addr);

        let (op_tx, op_rx) = unbounded();
        control.op_tx = Some(op_tx.clone());

        let io_core = core.clone();
        control.io_worker = Some(
            thread::Builder::new()
                .name("weft-tcp-server-io".to_string())
                .spawn(move || io_loop(io_core, listener, op_rx, op_tx))
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

/// One iteration per quantum: drain queued sends, accept at most one peer,
/// then pump a receive quantum on every healthy connection. Exits within a
/// quantum of `healthy` dropping; dropping the listener closes the acceptor.
fn io_loop(
    core: Arc<TcpServerCore>,
    listener: TcpListener,
    ops: Receiver<TcpSendOp>,
    op_tx: Sender<TcpSendOp>,
) {
    trace!("starting io worker for server: {}", core.state.alias());

    while core.state.healthy() {
        let mut progressed = false;

        while let Ok(op) = ops.try_recv() {
            progressed = true;
            op.connection.perform_send(&op.buffer, op.size);
        }
        if !core.state.healthy() {
            break;
        }

        match listener.accept() {
            Ok((socket, peer)) => {
                progressed = true;
                core.accept(socket, peer, &op_tx);
            }
            Err(idle) if is_quantum_idle(&idle) => {}
            Err(cause) => {
                let cause = ErrorKind::from(cause);
                warn!("error on accept for server {}: {}", core.state.alias(), cause);
                if cause.severity() != Severity::Transient {
                    error!(
                        "server {} cannot accept due to {}, server is not healthy",
                        core.state.alias(),
                        cause
                    );
                    core.state.set_health_status(false);
                }
                core.state.callbacks.fire_connection_error(cause);
            }
        }

        let connections = core.state.registry.connections();
        let idle_pass = connections.is_empty();
        for connection in connections {
            connection.poll_receive();
        }

        // With no connections the read timeouts cannot pace the loop.
        if idle_pass && !progressed {
            thread::sleep(core.state.config.poll_interval);
        }
    }

    trace!("stopping io worker for server: {}", core.state.alias());
    // Dropping the listener here closes the acceptor.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_bad_ports() {
        let server = TcpServerCore::make(Config::default());
        assert!(!server.start("notaport"));
        assert!(!server.start("65536"));
        assert!(!server.is_running());
    }

    #[test]
    fn stop_before_start_fires_stop_error() {
        let server = TcpServerCore::make(Config::default());
        assert!(!server.stop());
    }

    #[test]
    fn start_stop_round_trip() {
        let server = TcpServerCore::make(Config::default());
        assert!(server.start("0"));
        assert!(server.is_running());
        assert!(server.healthy());
        assert!(server.local_addr().is_some());

        assert!(!server.start("0")); // double start fails

        assert!(server.stop());
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert_eq!(server.connection_count(), 0);

        assert!(!server.stop()); // double stop fails
    }

    #[test]
    fn request_stop_clears_health_but_not_running() {
        let server = TcpServerCore::make(Config::default());
        assert!(server.start("0"));
        server.request_stop();
        assert!(server.is_running());
        assert!(!server.healthy());
        server.stop();
    }
}
