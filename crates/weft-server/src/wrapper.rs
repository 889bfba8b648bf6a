//! The public server wrapper.
//!
//! Wraps a transport core, installs the default logging layer, owns a
//! plugin manager, and re-exposes the core surface. `update()` is the
//! caller's polling hook: it ticks the plugins and reports current health.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use weft_core::{ClientId, Config, SharedBuffer};

use crate::callbacks::ServerCallbackRegister;
use crate::plugins::{ServerPlugin, ServerPluginManager};
use crate::state::{ServerApi, ServerHandle};
use crate::tcp::TcpServerCore;
use crate::udp::UdpServerCore;

/// A ready-to-use server over the given transport core.
pub struct Server<C: ServerApi + 'static> {
    core: Arc<C>,
    plugins: ServerPluginManager,
}

/// Stream-transport server.
pub type TcpServer = Server<TcpServerCore>;
/// Datagram-transport server.
pub type UdpServer = Server<UdpServerCore>;

impl TcpServer {
    /// Creates a stream server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a stream server with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self::from_core(TcpServerCore::make(config))
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpServer {
    /// Creates a datagram server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a datagram server with the given configuration.
    pub fn with_config(config: Config) -> Self {
        Self::from_core(UdpServerCore::make(config))
    }
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ServerApi + 'static> Server<C> {
    fn from_core(core: Arc<C>) -> Self {
        let base = core.alias();
        core.set_alias(&format!("{}({:p})", base, Arc::as_ptr(&core)));
        install_default_layer(core.callbacks());
        Self { core, plugins: ServerPluginManager::new() }
    }

    fn handle(&self) -> ServerHandle {
        self.core.clone() as ServerHandle
    }

    /// Starts listening on `port` (decimal text, validated to `[0, 65535]`).
    pub fn start(&self, port: &str) -> bool {
        self.core.start(port)
    }

    /// Stops the server; see [`ServerApi::stop`].
    pub fn stop(&self) -> bool {
        self.core.stop()
    }

    /// Flags the server unhealthy so its loops exit at the next quantum.
    pub fn request_stop(&self) {
        self.core.request_stop();
    }

    /// True between a successful start and the end of stop.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// True while running and no fatal condition was observed.
    pub fn healthy(&self) -> bool {
        self.core.healthy()
    }

    /// Human-readable alias.
    pub fn alias(&self) -> String {
        self.core.alias()
    }

    /// Replaces the alias.
    pub fn set_alias(&self, alias: &str) {
        self.core.set_alias(alias);
    }

    /// Address the server is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Sends to a connection by id.
    pub fn send_to(&self, id: ClientId, buffer: &SharedBuffer, size: usize) -> bool {
        self.core.send_to(id, buffer, size)
    }

    /// Sends a whole buffer by id.
    pub fn send_buffer_to(&self, id: ClientId, buffer: &SharedBuffer) -> bool {
        self.core.send_buffer_to(id, buffer)
    }

    /// Copies `data` into a fresh shared buffer and sends it by id.
    pub fn send_bytes_to(&self, id: ClientId, data: &[u8]) -> bool {
        self.core.send_bytes_to(id, data)
    }

    /// Sends a UTF-8 string's bytes by id.
    pub fn send_string_to(&self, id: ClientId, text: &str) -> bool {
        self.core.send_string_to(id, text)
    }

    /// Sends to a connection by endpoint string.
    pub fn send_to_endpoint(&self, endpoint: &str, buffer: &SharedBuffer, size: usize) -> bool {
        self.core.send_to_endpoint(endpoint, buffer, size)
    }

    /// Copies `data` into a fresh shared buffer and sends it by endpoint.
    pub fn send_bytes_to_endpoint(&self, endpoint: &str, data: &[u8]) -> bool {
        self.core.send_bytes_to_endpoint(endpoint, data)
    }

    /// Sends a UTF-8 string's bytes by endpoint.
    pub fn send_string_to_endpoint(&self, endpoint: &str, text: &str) -> bool {
        self.core.send_string_to_endpoint(endpoint, text)
    }

    /// Removes a connection by id, firing `on_disconnection`.
    pub fn disconnect(&self, id: ClientId) -> bool {
        self.core.disconnect(id)
    }

    /// Removes a connection by endpoint string.
    pub fn disconnect_endpoint(&self, endpoint: &str) -> bool {
        self.core.disconnect_endpoint(endpoint)
    }

    /// Access to the layered callback register.
    pub fn callbacks(&self) -> &ServerCallbackRegister {
        self.core.callbacks()
    }

    /// Attaches a plugin, installing its callback layer.
    pub fn attach_plugin<T: ServerPlugin>(&mut self, plugin: T) {
        self.plugins.attach(&self.handle(), plugin);
    }

    /// Detaches a plugin, removing its callback layer.
    pub fn detach_plugin<T: ServerPlugin>(&mut self) {
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

impl<C: ServerApi + 'static> Drop for Server<C> {
    fn drop(&mut self) {
        if self.core.is_running() {
            self.core.stop();
        }
    }
}

fn install_default_layer(callbacks: &ServerCallbackRegister) {
    callbacks
        .set_on_start_success(Arc::new(|server| info!("server started: {}", server.alias())));
    callbacks.set_on_stop_success(Arc::new(|| info!("server stopped")));
    callbacks.set_on_stop_error(Arc::new(|error| error!("server stop error: {}", error)));
    callbacks.set_on_connection(Arc::new(|server, connection| {
        info!("server accepted connection: {} - {}", server.alias(), connection.alias());
    }));
    callbacks.set_on_connection_error(Arc::new(|server, error| {
        error!("server connection error: {} - {}", server.alias(), error);
    }));
    callbacks.set_on_disconnection(Arc::new(|server, id| {
        info!("server disconnected: {} - {}", server.alias(), id);
    }));
    callbacks.set_on_disconnection_error(Arc::new(|server, error| {
        error!("server disconnection error: {} - {}", server.alias(), error);
    }));
    callbacks.set_on_sent(Arc::new(|server, connection, size| {
        info!("server sent: {} - {} - {} bytes", server.alias(), connection.alias(), size);
    }));
    callbacks.set_on_send_error(Arc::new(|server, connection, error, size| {
        let target = connection.map(|c| c.alias()).unwrap_or_else(|| "<none>".to_string());
        error!(
            "server send error: {} - {} - {} - {} bytes",
            server.alias(),
            target,
            error,
            size
        );
    }));
    callbacks.set_on_receive(Arc::new(|server, connection, _buffer, size| {
        info!("server received: {} - {} - {} bytes", server.alias(), connection.alias(), size);
    }));
    callbacks.set_on_receive_error(Arc::new(|server, connection, _buffer, error, _size| {
        let target = connection.map(|c| c.alias()).unwrap_or_else(|| "<none>".to_string());
        error!("server receive error: {} - {} - {}", server.alias(), target, error);
    }));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use weft_core::DEFAULT_LAYER;

    use super::*;
    use crate::plugins::ServerIdleTimeout;

    #[test]
    fn wrapper_installs_the_default_layer() {
        let server = TcpServer::new();
        assert_eq!(server.callbacks().list_layers(), vec![DEFAULT_LAYER.to_string()]);
    }

    #[test]
    fn attach_detach_round_trip_preserves_layers() {
        let mut server = UdpServer::new();
        let before = server.callbacks().list_layers();
        server.attach_plugin(ServerIdleTimeout::new(Duration::from_millis(50)));
        server.detach_plugin::<ServerIdleTimeout>();
        assert_eq!(server.callbacks().list_layers(), before);
    }

    #[test]
    fn update_reports_health() {
        let mut server = TcpServer::new();
        assert!(!server.update());
        assert!(server.start("0"));
        assert!(server.update());
        server.request_stop();
        assert!(!server.update());
        server.stop();
    }

    #[test]
    fn drop_stops_a_running_server() {
        let server = TcpServer::new();
        assert!(server.start("0"));
        drop(server); // must not hang or leak the worker threads
    }

    #[test]
    fn alias_names_the_transport() {
        let server = UdpServer::new();
        assert!(server.alias().starts_with("udp_server("));
    }
}
