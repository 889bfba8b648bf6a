//! The client core: connection state, control flow, and the I/O worker.
//!
//! All public operations serialise on the control mutex so that `connect`,
//! `disconnect` and `send` cannot interleave. The I/O worker owns the socket
//! outright: sends reach it through a channel and receives happen inline in
//! its loop, so no other thread ever touches the socket.

use std::sync::{
    Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, trace, warn};

use weft_core::{
    Config, ErrorKind, SharedBuffer,
    callbacks::SharableFactory,
    error::is_quantum_idle,
    lock,
};

use crate::callbacks::{ClientApi, ClientCallbackRegister, ClientHandle};
use crate::protocol::Protocol;

struct SendOp {
    buffer: SharedBuffer,
    size: usize,
}

struct ClientControl {
    worker: Option<JoinHandle<()>>,
    op_tx: Option<Sender<SendOp>>,
}

/// Protocol-generic client core.
///
/// Created through [`ClientCore::make`] so the callback register can hand the
/// client itself to sharable callbacks via a weak back-reference.
pub struct ClientCore<P: Protocol> {
    callbacks: ClientCallbackRegister,
    config: Config,
    connected: AtomicBool,
    healthy: AtomicBool,
    alias: Mutex<String>,
    control: Mutex<ClientControl>,
    self_ref: Weak<ClientCore<P>>,
    _protocol: std::marker::PhantomData<P>,
}

impl<P: Protocol> ClientCore<P> {
    /// Creates a disconnected client core.
    pub fn make(config: Config) -> std::sync::Arc<Self> {
        std::sync::Arc::new_cyclic(|weak: &Weak<ClientCore<P>>| {
            let sharable: SharableFactory<ClientHandle> = {
                let weak = weak.clone();
                Box::new(move || weak.upgrade().map(|core| core as ClientHandle))
            };
            ClientCore {
                callbacks: ClientCallbackRegister::new(config.callback_workers, sharable),
                config,
                connected: AtomicBool::new(false),
                healthy: AtomicBool::new(false),
                alias: Mutex::new(format!("{}_client", P::NAME)),
                control: Mutex::new(ClientControl { worker: None, op_tx: None }),
                self_ref: weak.clone(),
                _protocol: std::marker::PhantomData,
            }
        })
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn set_connect_status(&self, status: bool) {
        self.connected.store(status, Ordering::SeqCst);
        debug!("client {} connected status set to {}", self.alias(), status);
    }

    pub(crate) fn set_health_status(&self, status: bool) {
        self.healthy.store(status, Ordering::SeqCst);
        debug!("client {} health status set to {}", self.alias(), status);
    }

    /// Resolves the endpoint and connects. On success the callback pool is
    /// started, the client becomes connected and healthy, `on_connect`
    /// fires, and the I/O worker begins the receive loop. On failure the
    /// client state is left untouched, no callback fires, and `false` is
    /// returned. Connecting an already-connected client fails immediately.
    pub fn connect(&self, host: &str, port: &str) -> bool {
        let mut control = lock(&self.control);

        debug!("connecting client: {} to {}:{}", self.alias(), host, port);

        if self.connected() {
            error!("client already connected: {}", self.alias());
            return false;
        }
        if let Err(bad) = self.config.validate() {
            error!("invalid configuration for client {}: {}", self.alias(), bad);
            return false;
        }

        let socket = match P::connect(host, port, &self.config) {
            Ok(socket) => socket,
            Err(cause) => {
                error!("error connecting client {}: {}", self.alias(), cause);
                return false;
            }
        };

        let Some(core) = self.self_ref.upgrade() else {
            return false;
        };

        self.callbacks.unsafe_start_pool();
        self.set_connect_status(true);
        self.set_health_status(true);

        let (op_tx, op_rx) = unbounded();
        control.op_tx = Some(op_tx);

        self.callbacks.fire_connect();

        let worker = thread::Builder::new()
            .name(format!("weft-{}-client-io", P::NAME))
            .spawn(move || io_worker(core, socket, op_rx))
            .expect("failed to spawn client io worker");
        control.worker = Some(worker);

        debug!("connected client: {}", self.alias());
        true
    }

    fn disconnect_impl(&self) -> bool {
        let mut control = lock(&self.control);

        debug!("disconnecting client: {}", self.alias());

        if !self.connected() {
            warn!("client already disconnected: {}", self.alias());
            self.callbacks.fire_disconnect_error(ErrorKind::NotConnected);
            return false;
        }

        self.set_health_status(false);
        control.op_tx = None;
        if let Some(worker) = control.worker.take() {
            // A callback running on the worker may itself call disconnect;
            // the loop already observes non-health and exits on its own.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }

        self.callbacks.fire_disconnect();
        self.callbacks.unsafe_stop_pool();
        self.set_connect_status(false);

        debug!("disconnected client: {}", self.alias());
        true
    }

    fn send_impl(&self, buffer: &SharedBuffer, size: usize) -> bool {
        let control = lock(&self.control);

        trace!("preparing to send {} bytes for client: {}", size, self.alias());

        if !self.healthy() {
            error!("cannot send data from a non-healthy client: {}", self.alias());
            self.callbacks.fire_send_error(ErrorKind::NotConnected, 0);
            return false;
        }
        if size == 0 {
            error!("cannot send 0 bytes from client: {}", self.alias());
            self.callbacks.fire_send_error(ErrorKind::EmptySend, 0);
            return false;
        }
        if size > buffer.len() {
            error!(
                "cannot send more than the buffer length of {} bytes from client: {}",
                buffer.len(),
                self.alias()
            );
            self.callbacks.fire_send_error(
                ErrorKind::OversizedSend { requested: size, available: buffer.len() },
                0,
            );
            return false;
        }

        match control.op_tx.as_ref() {
            Some(op_tx) if op_tx.send(SendOp { buffer: buffer.clone(), size }).is_ok() => true,
            _ => {
                self.callbacks.fire_send_error(ErrorKind::NotConnected, 0);
                false
            }
        }
    }
}

impl<P: Protocol> ClientApi for ClientCore<P> {
    fn alias(&self) -> String {
        lock(&self.alias).clone()
    }

    fn set_alias(&self, alias: &str) {
        let mut current = lock(&self.alias);
        debug!("set alias for client: {} to: {}", current, alias);
        *current = alias.to_string();
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.connected()
    }

    fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }

    fn disconnect(&self) -> bool {
        self.disconnect_impl()
    }

    fn send(&self, buffer: &SharedBuffer, size: usize) -> bool {
        self.send_impl(buffer, size)
    }

    fn callbacks(&self) -> &ClientCallbackRegister {
        &self.callbacks
    }
}

/// One loop iteration per poll quantum: drain queued sends, then perform at
/// most one receive. The socket read timeout paces the loop; the loop exits
/// within one quantum of `healthy` dropping.
fn io_worker<P: Protocol>(
    core: std::sync::Arc<ClientCore<P>>,
    socket: P::Socket,
    ops: Receiver<SendOp>,
) {
    trace!("starting io worker for client: {}", core.alias());
    let mut receive_buffer = vec![0u8; core.config.buffer_capacity];

    while core.healthy() {
        while let Ok(op) = ops.try_recv() {
            match P::send(&socket, &op.buffer.as_slice()[..op.size]) {
                Ok(sent) => {
                    debug!("sent {} bytes for client: {}", sent, core.alias());
                    core.callbacks.fire_sent(sent);
                }
                Err(cause) => {
                    let cause = ErrorKind::from(cause);
                    warn!("error on send for client {}: {}", core.alias(), cause);
                    core.callbacks.fire_send_error(cause.clone(), 0);
                    if cause.is_client_fatal() {
                        error!(
                            "client {} cannot send due to {}, considered not healthy",
                            core.alias(),
                            cause
                        );
                        core.set_health_status(false);
                    }
                }
            }
        }

        if !core.healthy() {
            break;
        }

        match P::recv(&socket, &mut receive_buffer) {
            Ok(received) => {
                debug!("received {} bytes for client: {}", received, core.alias());
                let copy =
                    SharedBuffer::from_slice(&receive_buffer[..received], core.config.buffer_capacity);
                core.callbacks.fire_receive(copy, received);
            }
            Err(idle) if is_quantum_idle(&idle) => {}
            Err(cause) => {
                let cause = ErrorKind::from(cause);
                warn!("error on receive for client {}: {}", core.alias(), cause);
                if cause.is_client_fatal() {
                    error!(
                        "client {} stopping reads due to {}, considered not healthy",
                        core.alias(),
                        cause
                    );
                    core.set_health_status(false);
                }
                core.callbacks.fire_receive_error(SharedBuffer::empty(), cause, 0);
            }
        }
    }

    trace!("stopping io worker for client: {}", core.alias());
    // Dropping the socket here is what closes the connection.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Tcp;

    #[test]
    fn fresh_client_is_neither_connected_nor_healthy() {
        let client = ClientCore::<Tcp>::make(Config::default());
        assert!(!client.connected());
        assert!(!client.healthy());
    }

    #[test]
    fn disconnect_when_not_connected_fires_error_and_fails() {
        let client = ClientCore::<Tcp>::make(Config::default());
        let fired = std::sync::Arc::new(AtomicBool::new(false));
        let sink = fired.clone();
        client.callbacks().set_on_disconnect_error(std::sync::Arc::new(move |error| {
            assert_eq!(error, ErrorKind::NotConnected);
            sink.store(true, Ordering::SeqCst);
        }));
        assert!(!client.disconnect());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn send_when_not_connected_fires_error_and_fails() {
        let client = ClientCore::<Tcp>::make(Config::default());
        let fired = std::sync::Arc::new(AtomicBool::new(false));
        let sink = fired.clone();
        client.callbacks().set_on_send_error(std::sync::Arc::new(move |_, error, _| {
            assert_eq!(error, ErrorKind::NotConnected);
            sink.store(true, Ordering::SeqCst);
        }));
        assert!(!client.send_string("x"));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn connect_failure_leaves_state_unchanged() {
        let client = ClientCore::<Tcp>::make(Config::default());
        assert!(!client.connect("127.0.0.1", "1"));
        assert!(!client.connected());
        assert!(!client.healthy());
    }

    #[test]
    fn alias_round_trips() {
        let client = ClientCore::<Tcp>::make(Config::default());
        client.set_alias("alpha");
        assert_eq!(client.alias(), "alpha");
    }
}
