//! The public client wrapper.
//!
//! Wraps a [`ClientCore`], installs the default logging layer, owns a
//! plugin manager, and re-exposes the core surface. `update()` is the
//! caller's polling hook: it ticks the plugins and reports current health.

use std::sync::Arc;

use tracing::{error, info};

use weft_core::{Config, SharedBuffer};

use crate::callbacks::{ClientApi, ClientCallbackRegister, ClientHandle};
use crate::client::ClientCore;
use crate::plugins::{ClientPlugin, ClientPluginManager};
use crate::protocol::{Protocol, Tcp, Udp};

/// A ready-to-use client over the given transport.
pub struct Client<P: Protocol> {
    core: Arc<ClientCore<P>>,
    plugins: ClientPluginManager,
}

/// Stream-transport client.
pub type TcpClient = Client<Tcp>;
/// Datagram-transport client.
pub type UdpClient = Client<Udp>;

impl<P: Protocol> Client<P> {
    /// Creates a client with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a client with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let core = ClientCore::<P>::make(config);
        core.set_alias(&format!("{}_client({:p})", P::NAME, Arc::as_ptr(&core)));
        install_default_layer(core.callbacks());
        Self { core, plugins: ClientPluginManager::new() }
    }

    fn handle(&self) -> ClientHandle {
        self.core.clone() as ClientHandle
    }

    /// Connects to `host:port`, refreshing the alias to name the target.
    pub fn connect(&self, host: &str, port: &str) -> bool {
        self.core.set_alias(&format!("{}_client({}:{})", P::NAME, host, port));
        self.core.connect(host, port)
    }

    /// Disconnects; see [`ClientCore`] for the exact contract.
    pub fn disconnect(&self) -> bool {
        self.core.disconnect()
    }

    /// Sends `size` bytes out of `buffer`.
    pub fn send(&self, buffer: &SharedBuffer, size: usize) -> bool {
        self.core.send(buffer, size)
    }

    /// Sends a whole buffer.
    pub fn send_buffer(&self, buffer: &SharedBuffer) -> bool {
        self.core.send_buffer(buffer)
    }

    /// Copies `data` into a fresh buffer and sends it.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        self.core.send_bytes(data)
    }

    /// Sends a UTF-8 string's bytes.
    pub fn send_string(&self, text: &str) -> bool {
        self.core.send_string(text)
    }

    /// Human-readable alias.
    pub fn alias(&self) -> String {
        self.core.alias()
    }

    /// Replaces the alias.
    pub fn set_alias(&self, alias: &str) {
        self.core.set_alias(alias);
    }

    /// True between a successful connect and the end of disconnect.
    pub fn connected(&self) -> bool {
        self.core.connected()
    }

    /// True while connected and no fatal error was observed.
    pub fn healthy(&self) -> bool {
        self.core.healthy()
    }

    /// Access to the layered callback register.
    pub fn callbacks(&self) -> &ClientCallbackRegister {
        self.core.callbacks()
    }

    /// Attaches a plugin, installing its callback layer.
    pub fn attach_plugin<T: ClientPlugin>(&mut self, plugin: T) {
        self.plugins.attach(&self.handle(), plugin);
    }

    /// Detaches a plugin, removing its callback layer.
    pub fn detach_plugin<T: ClientPlugin>(&mut self) {
        self.plugins.detach::<T>(&self.handle());
    }

    /// Ticks the plugins and returns current health. This is the caller's
    /// polling hook.
    pub fn update(&mut self) -> bool {
        let handle = self.handle();
        self.plugins.tick(&handle);
        self.core.healthy()
    }
}

impl<P: Protocol> Default for Client<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> Drop for Client<P> {
    fn drop(&mut self) {
        if self.core.connected() {
            self.core.disconnect();
        }
    }
}

fn install_default_layer(callbacks: &ClientCallbackRegister) {
    callbacks.set_on_connect(Arc::new(|client| info!("client connected: {}", client.alias())));
    callbacks.set_on_disconnect(Arc::new(|| info!("client disconnected")));
    callbacks
        .set_on_disconnect_error(Arc::new(|error| error!("client disconnect error: {}", error)));
    callbacks.set_on_receive(Arc::new(|client, _buffer, size| {
        info!("client received: {} - {} bytes", client.alias(), size);
    }));
    callbacks.set_on_receive_error(Arc::new(|client, _buffer, error, _size| {
        error!("client receive error: {} - {}", client.alias(), error);
    }));
    callbacks.set_on_sent(Arc::new(|client, size| {
        info!("client sent: {} - {} bytes", client.alias(), size);
    }));
    callbacks.set_on_send_error(Arc::new(|client, error, size| {
        error!("client send error: {} - {} - {} bytes", client.alias(), error, size);
    }));
}
