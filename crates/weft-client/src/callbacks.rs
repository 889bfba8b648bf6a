//! Client event callbacks and their layered register.
//!
//! Seven events fan out through the register: `on_connect`, `on_disconnect`,
//! `on_disconnect_error`, `on_receive`, `on_receive_error`, `on_sent`, and
//! `on_send_error`. Sharable events hand the client back to the callback as
//! a [`ClientHandle`] so the callback can call into the API.

use std::sync::Arc;

use weft_core::{
    ErrorKind, SharedBuffer, callback_setters,
    callbacks::{RegisterInner, SharableFactory},
};

/// Object-safe view of a client, handed to callbacks and plugins.
pub trait ClientApi: Send + Sync {
    /// Human-readable alias for log lines.
    fn alias(&self) -> String;
    /// Replaces the alias.
    fn set_alias(&self, alias: &str);
    /// True between a successful `connect` and the end of `disconnect`.
    fn connected(&self) -> bool;
    /// True while the client is connected and no fatal error was observed.
    fn healthy(&self) -> bool;
    /// Capacity used when building buffers for the `send_bytes` family.
    fn buffer_capacity(&self) -> usize;
    /// Tears the connection down; see the client core for the exact contract.
    fn disconnect(&self) -> bool;
    /// Sends `size` bytes out of `buffer`; the send completes asynchronously.
    fn send(&self, buffer: &SharedBuffer, size: usize) -> bool;
    /// Access to the layered callback register.
    fn callbacks(&self) -> &ClientCallbackRegister;

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

/// Shared handle to a client, usable from any callback thread.
pub type ClientHandle = Arc<dyn ClientApi>;

/// Callback invoked when the client connects.
pub type OnConnect = Arc<dyn Fn(ClientHandle) + Send + Sync>;
/// Callback invoked when the client disconnects.
pub type OnDisconnect = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked when `disconnect` is called in an invalid state.
pub type OnDisconnectError = Arc<dyn Fn(ErrorKind) + Send + Sync>;
/// Callback invoked with a fresh copy of each received payload.
pub type OnReceive = Arc<dyn Fn(ClientHandle, SharedBuffer, usize) + Send + Sync>;
/// Callback invoked when a receive fails.
pub type OnReceiveError = Arc<dyn Fn(ClientHandle, SharedBuffer, ErrorKind, usize) + Send + Sync>;
/// Callback invoked when an asynchronous send completes.
pub type OnSent = Arc<dyn Fn(ClientHandle, usize) + Send + Sync>;
/// Callback invoked when a send fails validation or completion.
pub type OnSendError = Arc<dyn Fn(ClientHandle, ErrorKind, usize) + Send + Sync>;

/// One named layer of client callbacks. Every callback is optional and
/// carries a flag choosing synchronous or pool dispatch.
#[derive(Default, Clone)]
pub struct ClientCallbacks {
    /// `on_connect` callback, if set.
    pub on_connect: Option<OnConnect>,
    /// Dispatch `on_connect` on the worker pool when true.
    pub on_connect_is_async: bool,
    /// `on_disconnect` callback, if set.
    pub on_disconnect: Option<OnDisconnect>,
    /// Dispatch `on_disconnect` on the worker pool when true.
    pub on_disconnect_is_async: bool,
    /// `on_disconnect_error` callback, if set.
    pub on_disconnect_error: Option<OnDisconnectError>,
    /// Dispatch `on_disconnect_error` on the worker pool when true.
    pub on_disconnect_error_is_async: bool,
    /// `on_receive` callback, if set.
    pub on_receive: Option<OnReceive>,
    /// Dispatch `on_receive` on the worker pool when true.
    pub on_receive_is_async: bool,
    /// `on_receive_error` callback, if set.
    pub on_receive_error: Option<OnReceiveError>,
    /// Dispatch `on_receive_error` on the worker pool when true.
    pub on_receive_error_is_async: bool,
    /// `on_sent` callback, if set.
    pub on_sent: Option<OnSent>,
    /// Dispatch `on_sent` on the worker pool when true.
    pub on_sent_is_async: bool,
    /// `on_send_error` callback, if set.
    pub on_send_error: Option<OnSendError>,
    /// Dispatch `on_send_error` on the worker pool when true.
    pub on_send_error_is_async: bool,
}

/// Layered register of client callbacks.
///
/// Dispatches snapshot the layer set under the register lock and invoke
/// outside it, so callbacks may re-enter the register or the client API.
pub struct ClientCallbackRegister {
    inner: RegisterInner<ClientCallbacks>,
    sharable: SharableFactory<ClientHandle>,
}

impl ClientCallbackRegister {
    /// Creates a register whose pool has `workers` threads. The factory
    /// produces the owning client for sharable dispatches.
    pub fn new(workers: usize, sharable: SharableFactory<ClientHandle>) -> Self {
        Self { inner: RegisterInner::new(workers), sharable }
    }

    /// Inserts or replaces a named layer.
    pub fn add_layer(&self, name: &str, layer: ClientCallbacks) {
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
        set_on_connect / set_on_connect_for / set_on_connect_async / set_on_connect_async_for
            => (on_connect, on_connect_is_async): OnConnect,
        set_on_disconnect / set_on_disconnect_for / set_on_disconnect_async / set_on_disconnect_async_for
            => (on_disconnect, on_disconnect_is_async): OnDisconnect,
        set_on_disconnect_error / set_on_disconnect_error_for / set_on_disconnect_error_async / set_on_disconnect_error_async_for
            => (on_disconnect_error, on_disconnect_error_is_async): OnDisconnectError,
        set_on_receive / set_on_receive_for / set_on_receive_async / set_on_receive_async_for
            => (on_receive, on_receive_is_async): OnReceive,
        set_on_receive_error / set_on_receive_error_for / set_on_receive_error_async / set_on_receive_error_async_for
            => (on_receive_error, on_receive_error_is_async): OnReceiveError,
        set_on_sent / set_on_sent_for / set_on_sent_async / set_on_sent_async_for
            => (on_sent, on_sent_is_async): OnSent,
        set_on_send_error / set_on_send_error_for / set_on_send_error_async / set_on_send_error_async_for
            => (on_send_error, on_send_error_is_async): OnSendError,
    }

    /// Fires `on_connect` across every layer.
    pub fn fire_connect(&self) {
        let Some(client) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_connect {
                if layer.on_connect_is_async {
                    let client = client.clone();
                    self.inner.pool().execute(move || callback(client));
                } else {
                    callback(client.clone());
                }
            }
        }
    }

    /// Fires `on_disconnect` across every layer.
    pub fn fire_disconnect(&self) {
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_disconnect {
                if layer.on_disconnect_is_async {
                    self.inner.pool().execute(move || callback());
                } else {
                    callback();
                }
            }
        }
    }

    /// Fires `on_disconnect_error` across every layer.
    pub fn fire_disconnect_error(&self, error: ErrorKind) {
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_disconnect_error {
                let error = error.clone();
                if layer.on_disconnect_error_is_async {
                    self.inner.pool().execute(move || callback(error));
                } else {
                    callback(error);
                }
            }
        }
    }

    /// Fires `on_receive` across every layer.
    pub fn fire_receive(&self, buffer: SharedBuffer, size: usize) {
        let Some(client) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_receive {
                let client = client.clone();
                let buffer = buffer.clone();
                if layer.on_receive_is_async {
                    self.inner.pool().execute(move || callback(client, buffer, size));
                } else {
                    callback(client, buffer, size);
                }
            }
        }
    }

    /// Fires `on_receive_error` across every layer.
    pub fn fire_receive_error(&self, buffer: SharedBuffer, error: ErrorKind, size: usize) {
        let Some(client) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_receive_error {
                let client = client.clone();
                let buffer = buffer.clone();
                let error = error.clone();
                if layer.on_receive_error_is_async {
                    self.inner.pool().execute(move || callback(client, buffer, error, size));
                } else {
                    callback(client, buffer, error, size);
                }
            }
        }
    }

    /// Fires `on_sent` across every layer.
    pub fn fire_sent(&self, size: usize) {
        let Some(client) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_sent {
                let client = client.clone();
                if layer.on_sent_is_async {
                    self.inner.pool().execute(move || callback(client, size));
                } else {
                    callback(client, size);
                }
            }
        }
    }

    /// Fires `on_send_error` across every layer.
    pub fn fire_send_error(&self, error: ErrorKind, size: usize) {
        let Some(client) = (self.sharable)() else { return };
        for layer in self.inner.snapshot() {
            if let Some(callback) = layer.on_send_error {
                let client = client.clone();
                let error = error.clone();
                if layer.on_send_error_is_async {
                    self.inner.pool().execute(move || callback(client, error, size));
                } else {
                    callback(client, error, size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use weft_core::DEFAULT_LAYER;

    use super::*;

    struct StubClient {
        register: ClientCallbackRegister,
    }

    impl StubClient {
        fn make() -> Arc<Self> {
            Arc::new_cyclic(|weak: &std::sync::Weak<StubClient>| {
                let weak = weak.clone();
                let sharable: SharableFactory<ClientHandle> =
                    Box::new(move || weak.upgrade().map(|c| c as ClientHandle));
                StubClient { register: ClientCallbackRegister::new(1, sharable) }
            })
        }
    }

    impl ClientApi for StubClient {
        fn alias(&self) -> String {
            "stub".to_string()
        }
        fn set_alias(&self, _alias: &str) {}
        fn connected(&self) -> bool {
            true
        }
        fn healthy(&self) -> bool {
            true
        }
        fn buffer_capacity(&self) -> usize {
            1024
        }
        fn disconnect(&self) -> bool {
            false
        }
        fn send(&self, _buffer: &SharedBuffer, _size: usize) -> bool {
            false
        }
        fn callbacks(&self) -> &ClientCallbackRegister {
            &self.register
        }
    }

    #[test]
    fn layers_fire_in_stable_name_order() {
        let client = StubClient::make();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let register = client.callbacks();
        for name in ["metrics", DEFAULT_LAYER, "audit"] {
            register.add_layer(name, ClientCallbacks::default());
            let seen = seen.clone();
            let tag = name.to_string();
            register.set_on_receive_for(
                name,
                Arc::new(move |_, _, _| seen.lock().unwrap().push(tag.clone())),
            );
        }

        register.fire_receive(SharedBuffer::from_slice(b"x", 16), 1);
        register.fire_receive(SharedBuffer::from_slice(b"y", 16), 1);

        let seen = seen.lock().unwrap();
        // BTreeMap order: "__default_layer__" < "audit" < "metrics", repeated per dispatch.
        assert_eq!(
            *seen,
            vec![DEFAULT_LAYER, "audit", "metrics", DEFAULT_LAYER, "audit", "metrics"]
        );
    }

    #[test]
    fn callbacks_receive_the_sharable_handle() {
        let client = StubClient::make();
        let aliases = Arc::new(Mutex::new(Vec::new()));
        let sink = aliases.clone();
        client
            .callbacks()
            .set_on_connect(Arc::new(move |c| sink.lock().unwrap().push(c.alias())));
        client.callbacks().fire_connect();
        assert_eq!(*aliases.lock().unwrap(), vec!["stub".to_string()]);
    }

    #[test]
    fn async_flag_routes_through_the_pool() {
        let client = StubClient::make();
        let register = client.callbacks();
        register.unsafe_start_pool();

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        register.set_on_sent(Arc::new(move |_, size| {
            sink.fetch_add(size, Ordering::SeqCst);
        }));
        register.set_on_sent_async(true);

        for _ in 0..8 {
            register.fire_sent(3);
        }
        register.unsafe_stop_pool(); // drains pending jobs
        assert_eq!(count.load(Ordering::SeqCst), 24);
    }

    #[test]
    fn callback_may_mutate_the_register_during_dispatch() {
        let client = StubClient::make();
        let register = client.callbacks();
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = client.clone();
        let sink = fired.clone();
        register.set_on_disconnect(Arc::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
            // Re-entering the register must not deadlock.
            handle.callbacks().add_layer("late", ClientCallbacks::default());
        }));

        register.fire_disconnect();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(register.list_layers().contains(&"late".to_string()));
    }

    #[test]
    fn set_on_missing_layer_is_ignored() {
        let client = StubClient::make();
        let register = client.callbacks();
        register.set_on_receive_for("nope", Arc::new(|_, _, _| {}));
        assert!(register.list_layers().is_empty());
    }
}
