//! Server event callbacks and their layered register.
//!
//! Eleven events fan out through the register. All but `on_stop_success` and
//! `on_stop_error` are sharable: the callback receives the server itself as
//! a [`ServerHandle`] so it can call back into the API (send, disconnect,
//! request a stop). Send and receive error events may carry no connection
//! when the failure happened before a connection could be resolved.

use std::sync::Arc;

use weft_core::{
    ClientId, ErrorKind, SharedBuffer, callback_setters,
    callbacks::{RegisterInner, SharableFactory},
};

use crate::connection::ConnectionHandle;
use crate::state::ServerHandle;

/// Callback invoked when the server starts successfully.
pub type OnStartSuccess = Arc<dyn Fn(ServerHandle) + Send + Sync>;
/// Callback invoked when the server stops successfully.
pub type OnStopSuccess = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked when `stop` is called in an invalid state.
pub type OnStopError = Arc<dyn Fn(ErrorKind) + Send + Sync>;
/// Callback invoked for every newly registered connection.
pub type OnConnection = Arc<dyn Fn(ServerHandle, ConnectionHandle) + Send + Sync>;
/// Callback invoked when an accept or registration fails.
pub type OnConnectionError = Arc<dyn Fn(ServerHandle, ErrorKind) + Send + Sync>;
/// Callback invoked when a connection is removed from the registry.
pub type OnDisconnection = Arc<dyn Fn(ServerHandle, ClientId) + Send + Sync>;
/// Callback invoked when a removal misses the registry.
pub type OnDisconnectionError = Arc<dyn Fn(ServerHandle, ErrorKind) + Send + Sync>;
/// Callback invoked when an asynchronous send completes.
pub type OnSent = Arc<dyn Fn(ServerHandle, ConnectionHandle, usize) + Send + Sync>;
/// Callback invoked when a send fails validation or completion.
pub type OnSendError =
    Arc<dyn Fn(ServerHandle, Option<ConnectionHandle>, ErrorKind, usize) + Send + Sync>;
/// Callback invoked with a fresh copy of each received payload.
pub type OnReceive = Arc<dyn Fn(ServerHandle, ConnectionHandle, SharedBuffer, usize) + Send + Sync>;
/// Callback invoked when a receive fails.
pub type OnReceiveError = Arc<
    dyn Fn(ServerHandle, Option<ConnectionHandle>, SharedBuffer, ErrorKind, usize) + Send + Sync,
>;

/// One named layer of server callbacks. Every callback is optional and
/// carries a flag choosing synchronous or pool dispatch.
#[derive(Default, Clone)]
pub struct ServerCallbacks {
    /// `on_start_success` callback, if set.
    pub on_start_success: Option<OnStartSuccess>,
    /// Dispatch `on_start_success` on the worker pool when true.
    pub on_start_success_is_async: bool,
    /// `on_stop_success` callback, if set.
    pub on_stop_success: Option<OnStopSuccess>,
    /// Dispatch `on_stop_success` on the worker pool when true.
    pub on_stop_success_is_async: bool,
    /// `on_stop_error` callback, if set.
    pub on_stop_error: Option<OnStopError>,
    /// Dispatch `on_stop_error` on the worker pool when true.
    pub on_stop_error_is_async: bool,
    /// `on_connection` callback, if set.
    pub on_connection: Option<OnConnection>,
    /// Dispatch `on_connection` on the worker pool when true.
    pub on_connection_is_async: bool,
    /// `on_connection_error` callback, if set.
    pub on_connection_error: Option<OnConnectionError>,
    /// Dispatch `on_connection_error` on the worker pool when true.
    pub on_connection_error_is_async: bool,
    /// `on_disconnection` callback, if set.
    pub on_disconnection: Option<OnDisconnection>,
    /// Dispatch `on_disconnection` on the worker pool when true.
    pub on_disconnection_is_async: bool,
    /// `on_disconnection_error` callback, if set.
    pub on_disconnection_error: Option<OnDisconnectionError>,
    /// Dispatch `on_disconnection_error` on the worker pool when true.
    pub on_disconnection_error_is_async: bool,
    /// `on_sent` callback, if set.
    pub on_sent: Option<OnSent>,
    /// Dispatch `on_sent` on the worker pool when true.
    pub on_sent_is_async: bool,
    /// `on_send_error` callback, if set.
    pub on_send_error: Option<OnSendError>,
    /// Dispatch `on_send_error` on the worker pool when true.
    pub on_send_error_is_async: bool,
    /// `on_receive` callback, if set.
    pub on_receive: Option<OnReceive>,
    /// Dispatch `on_receive` on the worker pool when true.
    pub on_receive_is_async: bool,
    /// `on_receive_error` callback, if set.
    pub on_receive_error: Option<OnReceiveError>,
    /// Dispatch `on_receive_error` on the worker pool when true.
    pub on_receive_error_is_async: bool,
}

/// Layered register of server callbacks.
///
/// Dispatches snapshot the layer set under the register lock and invoke
/// outside it, so callbacks may re-enter the register or the server API.
pub struct ServerCallbackRegister {
    inner: RegisterInner<ServerCallbacks>,
    sharable: SharableFactory<ServerHandle>,
}

impl ServerCallbackRegister {
    /// Creates a register whose pool has `workers` threads. The factory
    /// produces the owning server for sharable dispatches.
    pub fn new(workers: usize, sharable: SharableFactory<ServerHandle>) -> Self {
        Self { inner: RegisterInner::new(workers), sharable }
    }

    /// Inserts or replaces a named layer.
    pub fn add_layer(&self, name: &str, layer: ServerCallbacks) {
        self.inner.add_layer(name, layer);
    }

    /// Deletes a layer; missing names are a no-op.
    pub fn remove_layer(&self, name: &str) {
        self.inner.remove_layer(name);
    }

    /// Snapshot of the current layer names.
    pub fn list_layers(&self) -> Vec<String> {
        self.inner.list_layers()
    }

    /// Removes all layers.
    pub fn clear_layers(&self) {
        self.inner.clear_layers();
    }

    /// Internal lifecycle hook starting the callback pool.
    pub fn unsafe_start_pool(&self) {
        self.inner.unsafe_start_pool();
    }

    /// Internal lifecycle hook stopping the callback pool.
    pub fn unsafe_stop_pool(&self) {
        self.inner.unsafe_stop_pool();
    }

    callback_setters! {
        set_on_start_success / set_on_start_success_for / set_on_start_success_async / set_on_start_success_async_for
            => (on_start_success, on_start_success_is_async): OnStartSuccess,
        set_on_stop_success / set_on_stop_success_for / set_on_stop_success_async / set_on_stop_success_async_for
            => (on_stop_success, on_stop_success_is_async): OnStopSuccess,
        set_on_stop_error / set_on_stop_error_for / set_on_stop_error_async / set_on_stop_error_async_for
            => (on_stop_error, on_stop_error_is_async): OnStopError,
        set_on_connection / set_on_connection_for / set_on_connection_async / set_on_connection_async_for
            => (on_connection, on_connection_is_async): OnConnection,
        set_on_connection_error / set_on_connection_error_for / set_on_connection_error_async / set_on_connection_error_async_for
            => (on_connection_error, on_connection_error_is_async): OnConnectionError,
        set_on_disconnection / set_on_disconnection_for / set_on_disconnection_async / set_on_disconnection_async_for
            => (on_disconnection, on_disconnection_is_async): OnDisconnection,
        set_on_disconnection_error / set_on_disconnection_error_for / set_on_disconnection_error_async / set_on_disconnection_error_async_for
            => (on_disconnection_error, on_disconnection_error_is_async): OnDisconnectionError,
        set_on_sent / set_on_sent_for / set_on_sent_async / set_on_sent_async_for
            => (on_sent, on_sent_is_async): OnSent,
        set_on_send_error / set_on_send_error_for / set_on_send_error_async / set_on_send_error_async_for
            => (on_send_error, on_send_error_is_async): OnSendError,
        set_on_receive / set_on_receive_for / set_on_receive_async / set_on_receive_async_for
            => (on_receive, on_receive_is_async): OnReceive,
        set_on_receive_error / set_on_receive_error_for / set_on_receive_error_async / set_on_receive_error_async_for
            => (on_receive_error, on_receive_error_is_async): OnReceiveError,
    }

    /// Fires `on_start_success` across every layer.
    pub fn fire_start_success(&self) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_start_success {
                let server = server.clone();
                if layer.on_start_success_is_async {
                    self.inner.pool().execute(move || callback(server));
                } else {
                    callback(server);
                }
            }
        }
    }

    /// Fires `on_stop_success` across every layer.
    pub fn fire_stop_success(&self) {
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_stop_success {
                if layer.on_stop_success_is_async {
                    self.inner.pool().execute(move || callback());
                } else {
                    callback();
                }
            }
        }
    }

    /// Fires `on_stop_error` across every layer.
    pub fn fire_stop_error(&self, error: ErrorKind) {
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_stop_error {
                let error = error.clone();
                if layer.on_stop_error_is_async {
                    self.inner.pool().execute(move || callback(error));
                } else {
                    callback(error);
                }
            }
        }
    }

    /// Fires `on_connection` across every layer.
    pub fn fire_connection(&self, connection: ConnectionHandle) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_connection {
                let server = server.clone();
                let connection = connection.clone();
                if layer.on_connection_is_async {
                    self.inner.pool().execute(move || callback(server, connection));
                } else {
                    callback(server, connection);
                }
            }
        }
    }

    /// Fires `on_connection_error` across every layer.
    pub fn fire_connection_error(&self, error: ErrorKind) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_connection_error {
                let server = server.clone();
                let error = error.clone();
                if layer.on_connection_error_is_async {
                    self.inner.pool().execute(move || callback(server, error));
                } else {
                    callback(server, error);
                }
            }
        }
    }

    /// Fires `on_disconnection` across every layer.
    pub fn fire_disconnection(&self, id: ClientId) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_disconnection {
                let server = server.clone();
                if layer.on_disconnection_is_async {
                    self.inner.pool().execute(move || callback(server, id));
                } else {
                    callback(server, id);
                }
            }
        }
    }

    /// Fires `on_disconnection_error` across every layer.
    pub fn fire_disconnection_error(&self, error: ErrorKind) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_disconnection_error {
                let server = server.clone();
                let error = error.clone();
                if layer.on_disconnection_error_is_async {
                    self.inner.pool().execute(move || callback(server, error));
                } else {
                    callback(server, error);
                }
            }
        }
    }

    /// Fires `on_sent` across every layer.
    pub fn fire_sent(&self, connection: ConnectionHandle, size: usize) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_sent {
                let server = server.clone();
                let connection = connection.clone();
                if layer.on_sent_is_async {
                    self.inner.pool().execute(move || callback(server, connection, size));
                } else {
                    callback(server, connection, size);
                }
            }
        }
    }

    /// Fires `on_send_error` across every layer. `connection` is `None`
    /// when the send failed before a connection could be resolved.
    pub fn fire_send_error(
        &self,
        connection: Option<ConnectionHandle>,
        error: ErrorKind,
        size: usize,
    ) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_send_error {
                let server = server.clone();
                let connection = connection.clone();
                let error = error.clone();
                if layer.on_send_error_is_async {
                    self.inner.pool().execute(move || callback(server, connection, error, size));
                } else {
                    callback(server, connection, error, size);
                }
            }
        }
    }

    /// Fires `on_receive` across every layer.
    pub fn fire_receive(&self, connection: ConnectionHandle, buffer: SharedBuffer, size: usize) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_receive {
                let server = server.clone();
                let connection = connection.clone();
                let buffer = buffer.clone();
                if layer.on_receive_is_async {
                    self.inner.pool().execute(move || callback(server, connection, buffer, size));
                } else {
                    callback(server, connection, buffer, size);
                }
            }
        }
    }

    /// Fires `on_receive_error` across every layer.
    pub fn fire_receive_error(
        &self,
        connection: Option<ConnectionHandle>,
        buffer: SharedBuffer,
        error: ErrorKind,
        size: usize,
    ) {
        let Some(server) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_receive_error {
                let server = server.clone();
                let connection = connection.clone();
                let buffer = buffer.clone();
                let error = error.clone();
                if layer.on_receive_error_is_async {
                    self.inner
                        .pool()
                        .execute(move || callback(server, connection, buffer, error, size));
                } else {
                    callback(server, connection, buffer, error, size);
                }
            }
        }
    }
}
