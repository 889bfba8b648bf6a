//! Server plugins: cross-cutting behaviours attached as callback layers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use weft_core::{
    ClientId, lock,
    time::{Clock, SystemClock},
};

use crate::callbacks::ServerCallbacks;
use crate::state::ServerHandle;

/// A server plugin type.
///
/// `TAG` is the stable type tag: unique per plugin type, stable across runs,
/// and used as the name of the callback layer the plugin installs.
pub trait ServerPlugin: Send + 'static {
    /// Stable type tag, also the plugin's callback layer name.
    const TAG: &'static str;

    /// When true, `on_update` is skipped while the owner is not healthy.
    fn require_connection_on(&self) -> bool;

    /// Periodic work, run synchronously from the owner's `update()`.
    fn on_update(&mut self, server: &ServerHandle);

    /// The callback layer this plugin wants installed.
    fn callbacks(&self) -> ServerCallbacks;
}

/// Object-safe bridge so the manager can store heterogeneous plugins.
trait AnyServerPlugin: Send {
    fn tag(&self) -> &'static str;
    fn require_connection_on(&self) -> bool;
    fn on_update(&mut self, server: &ServerHandle);
}

impl<T: ServerPlugin> AnyServerPlugin for T {
    fn tag(&self) -> &'static str {
        T::TAG
    }
    fn require_connection_on(&self) -> bool {
        ServerPlugin::require_connection_on(self)
    }
    fn on_update(&mut self, server: &ServerHandle) {
        ServerPlugin::on_update(self, server);
    }
}

/// Owns plugin instances and keeps their callback layers wired.
///
/// Plugins tick in insertion order. Attaching a plugin whose tag is already
/// present replaces the previous instance and its layer.
#[derive(Default)]
pub struct ServerPluginManager {
    plugins: Vec<Box<dyn AnyServerPlugin>>,
}

impl ServerPluginManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Installs a plugin's callback layer on `owner` and records the
    /// instance.
    pub fn attach<T: ServerPlugin>(&mut self, owner: &ServerHandle, plugin: T) {
        owner.callbacks().add_layer(T::TAG, plugin.callbacks());
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.tag() == T::TAG) {
            *existing = Box::new(plugin);
        } else {
            self.plugins.push(Box::new(plugin));
        }
    }

    /// Removes the plugin's layer and drops the instance.
    pub fn detach<T: ServerPlugin>(&mut self, owner: &ServerHandle) {
        owner.callbacks().remove_layer(T::TAG);
        self.plugins.retain(|p| p.tag() != T::TAG);
    }

    /// Runs every plugin's `on_update` in insertion order, skipping plugins
    /// that require a healthy owner when it is not.
    pub fn tick(&mut self, owner: &ServerHandle) {
        for plugin in &mut self.plugins {
            if plugin.require_connection_on() && !owner.healthy() {
                continue;
            }
            plugin.on_update(owner);
        }
    }

    /// Number of attached plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// True when no plugin is attached.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Disconnects connections after a period without activity.
///
/// Tracks a last-activity timestamp per connection: inserted on
/// `on_connection`, refreshed on `on_receive`, removed on
/// `on_disconnection`. Each tick disconnects every connection whose idle age
/// exceeds the timeout.
pub struct ServerIdleTimeout {
    activity: Arc<Mutex<HashMap<ClientId, Instant>>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ServerIdleTimeout {
    /// Creates the plugin with the system clock.
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    /// Creates the plugin with an injected clock.
    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { activity: Arc::new(Mutex::new(HashMap::new())), timeout, clock }
    }
}

impl ServerPlugin for ServerIdleTimeout {
    const TAG: &'static str = "server_idle_timeout";

    fn require_connection_on(&self) -> bool {
        true
    }

    fn on_update(&mut self, server: &ServerHandle) {
        let now = self.clock.now();
        let expired: Vec<ClientId> = {
            let activity = lock(&self.activity);
            activity
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > self.timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            debug!("client {} idle past {:?}, disconnecting", id, self.timeout);
            server.disconnect(id);
            lock(&self.activity).remove(&id);
        }
    }

    fn callbacks(&self) -> ServerCallbacks {
        let on_connection = {
            let activity = self.activity.clone();
            let clock = self.clock.clone();
            Arc::new(move |_server: ServerHandle, connection: crate::connection::ConnectionHandle| {
                lock(&activity).insert(connection.id(), clock.now());
            })
        };
        let on_disconnection = {
            let activity = self.activity.clone();
            Arc::new(move |_server: ServerHandle, id: ClientId| {
                lock(&activity).remove(&id);
            })
        };
        let on_receive = {
            let activity = self.activity.clone();
            let clock = self.clock.clone();
            Arc::new(
                move |_server: ServerHandle,
                      connection: crate::connection::ConnectionHandle,
                      _buffer: weft_core::SharedBuffer,
                      _size: usize| {
                    lock(&activity).insert(connection.id(), clock.now());
                },
            )
        };
        ServerCallbacks {
            on_connection: Some(on_connection),
            on_disconnection: Some(on_disconnection),
            on_receive: Some(on_receive),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use weft_core::{SharedBuffer, callbacks::SharableFactory};

    use super::*;
    use crate::callbacks::ServerCallbackRegister;
    use crate::state::ServerApi;

    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(Instant::now()) })
        }
        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    struct MockServer {
        register: ServerCallbackRegister,
        healthy: AtomicBool,
        disconnected: Mutex<Vec<ClientId>>,
    }

    impl MockServer {
        fn make(healthy: bool) -> Arc<Self> {
            Arc::new_cyclic(|weak: &std::sync::Weak<MockServer>| {
                let weak = weak.clone();
                let sharable: SharableFactory<ServerHandle> =
                    Box::new(move || weak.upgrade().map(|s| s as ServerHandle));
                MockServer {
                    register: ServerCallbackRegister::new(1, sharable),
                    healthy: AtomicBool::new(healthy),
                    disconnected: Mutex::new(Vec::new()),
                }
            })
        }
    }

    impl ServerApi for MockServer {
        fn start(&self, _port: &str) -> bool {
            false
        }
        fn stop(&self) -> bool {
            false
        }
        fn request_stop(&self) {}
        fn is_running(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        fn healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        fn alias(&self) -> String {
            "mock_server".to_string()
        }
        fn set_alias(&self, _alias: &str) {}
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn buffer_capacity(&self) -> usize {
            1024
        }
        fn connection_count(&self) -> usize {
            0
        }
        fn send_to(&self, _id: ClientId, _buffer: &SharedBuffer, _size: usize) -> bool {
            false
        }
        fn send_to_endpoint(&self, _endpoint: &str, _buffer: &SharedBuffer, _size: usize) -> bool {
            false
        }
        fn disconnect(&self, id: ClientId) -> bool {
            self.disconnected.lock().unwrap().push(id);
            true
        }
        fn disconnect_endpoint(&self, _endpoint: &str) -> bool {
            false
        }
        fn callbacks(&self) -> &ServerCallbackRegister {
            &self.register
        }
    }

    #[test]
    fn stale_entries_are_disconnected_on_tick() {
        let clock = FakeClock::new();
        let server = MockServer::make(true);
        let handle: ServerHandle = server.clone();

        let plugin = ServerIdleTimeout::with_clock(Duration::from_millis(200), clock.clone());
        let activity = plugin.activity.clone();
        let mut manager = ServerPluginManager::new();
        manager.attach(&handle, plugin);

        // Simulate two tracked connections without a real accept path.
        lock(&activity).insert(1, clock.now());
        lock(&activity).insert(2, clock.now());

        clock.advance(Duration::from_millis(100));
        lock(&activity).insert(2, clock.now()); // activity refresh for id 2
        clock.advance(Duration::from_millis(150));

        manager.tick(&handle);
        let disconnected = server.disconnected.lock().unwrap().clone();
        assert_eq!(disconnected, vec![1]);
        assert!(lock(&activity).contains_key(&2));
        assert!(!lock(&activity).contains_key(&1));
    }

    #[test]
    fn disconnection_event_clears_the_entry() {
        let clock = FakeClock::new();
        let server = MockServer::make(true);
        let handle: ServerHandle = server.clone();

        let plugin = ServerIdleTimeout::with_clock(Duration::from_millis(50), clock.clone());
        let activity = plugin.activity.clone();
        let mut manager = ServerPluginManager::new();
        manager.attach(&handle, plugin);

        lock(&activity).insert(9, clock.now());
        server.callbacks().fire_disconnection(9);
        assert!(lock(&activity).is_empty());
    }

    #[test]
    fn attach_then_detach_restores_layer_set() {
        let server = MockServer::make(true);
        let handle: ServerHandle = server.clone();
        let before = server.callbacks().list_layers();

        let mut manager = ServerPluginManager::new();
        manager.attach(&handle, ServerIdleTimeout::new(Duration::from_millis(50)));
        assert!(server
            .callbacks()
            .list_layers()
            .contains(&ServerIdleTimeout::TAG.to_string()));
        manager.detach::<ServerIdleTimeout>(&handle);
        assert_eq!(server.callbacks().list_layers(), before);
    }

    #[test]
    fn tick_skips_unhealthy_owner() {
        let clock = FakeClock::new();
        let server = MockServer::make(false);
        let handle: ServerHandle = server.clone();

        let plugin = ServerIdleTimeout::with_clock(Duration::from_millis(10), clock.clone());
        let activity = plugin.activity.clone();
        let mut manager = ServerPluginManager::new();
        manager.attach(&handle, plugin);

        lock(&activity).insert(1, clock.now());
        clock.advance(Duration::from_secs(1));
        manager.tick(&handle);
        assert!(server.disconnected.lock().unwrap().is_empty());
    }
}
