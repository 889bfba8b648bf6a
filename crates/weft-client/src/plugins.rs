//! Client plugins: cross-cutting behaviours attached as callback layers.
//!
//! A plugin contributes one callback layer (named by its stable type tag)
//! and a periodic `on_update` driven by the wrapper's `update()` call.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use weft_core::{
    lock,
    time::{Clock, SystemClock},
};

use crate::callbacks::{ClientCallbacks, ClientHandle};

/// A client plugin type.
///
/// `TAG` is the stable type tag: unique per plugin type, stable across runs,
/// and used as the name of the callback layer the plugin installs.
pub trait ClientPlugin: Send + 'static {
    /// Stable type tag, also the plugin's callback layer name.
    const TAG: &'static str;

    /// When true, `on_update` is skipped while the owner is not healthy.
    fn require_connection_on(&self) -> bool;

    /// Periodic work, run synchronously from the owner's `update()`.
    fn on_update(&mut self, client: &ClientHandle);

    /// The callback layer this plugin wants installed.
    fn callbacks(&self) -> ClientCallbacks;
}

/// Object-safe bridge so the manager can store heterogeneous plugins.
trait AnyClientPlugin: Send {
    fn tag(&self) -> &'static str;
    fn require_connection_on(&self) -> bool;
    fn on_update(&mut self, client: &ClientHandle);
}

impl<T: ClientPlugin> AnyClientPlugin for T {
    fn tag(&self) -> &'static str {
        T::TAG
    }
    fn require_connection_on(&self) -> bool {
        ClientPlugin::require_connection_on(self)
    }
    fn on_update(&mut self, client: &ClientHandle) {
        ClientPlugin::on_update(self, client);
    }
}

/// Owns plugin instances and keeps their callback layers wired.
///
/// Plugins tick in insertion order. Attaching a plugin whose tag is already
/// present replaces the previous instance and its layer.
#[derive(Default)]
pub struct ClientPluginManager {
    plugins: Vec<Box<dyn AnyClientPlugin>>,
}

impl ClientPluginManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Installs a plugin's callback layer on `owner` and records the
    /// instance.
    pub fn attach<T: ClientPlugin>(&mut self, owner: &ClientHandle, plugin: T) {
        owner.callbacks().add_layer(T::TAG, plugin.callbacks());
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.tag() == T::TAG) {
            *existing = Box::new(plugin);
        } else {
            self.plugins.push(Box::new(plugin));
        }
    }

    /// Removes the plugin's layer and drops the instance.
    pub fn detach<T: ClientPlugin>(&mut self, owner: &ClientHandle) {
        owner.callbacks().remove_layer(T::TAG);
        self.plugins.retain(|p| p.tag() != T::TAG);
    }

    /// Runs every plugin's `on_update` in insertion order, skipping plugins
    /// that require a healthy owner when it is not.
    pub fn tick(&mut self, owner: &ClientHandle) {
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

/// Disconnects the client after a period without activity.
///
/// Activity is refreshed on connect and on every receive; `on_update`
/// disconnects once the idle age exceeds the configured timeout.
pub struct ClientIdleTimeout {
    last_activity: Arc<Mutex<Instant>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ClientIdleTimeout {
    /// Creates the plugin with the system clock.
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    /// Creates the plugin with an injected clock.
    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { last_activity: Arc::new(Mutex::new(clock.now())), timeout, clock }
    }
}

impl ClientPlugin for ClientIdleTimeout {
    const TAG: &'static str = "client_idle_timeout";

    fn require_connection_on(&self) -> bool {
        true
    }

    fn on_update(&mut self, client: &ClientHandle) {
        let idle = self.clock.now().saturating_duration_since(*lock(&self.last_activity));
        if idle > self.timeout {
            debug!("client idle for {:?}, disconnecting: {}", idle, client.alias());
            client.disconnect();
        }
    }

    fn callbacks(&self) -> ClientCallbacks {
        let on_connect = {
            let last = self.last_activity.clone();
            let clock = self.clock.clone();
            Arc::new(move |_client: ClientHandle| {
                *lock(&last) = clock.now();
            })
        };
        let on_receive = {
            let last = self.last_activity.clone();
            let clock = self.clock.clone();
            Arc::new(move |_client: ClientHandle, _buffer: weft_core::SharedBuffer, _size: usize| {
                *lock(&last) = clock.now();
            })
        };
        ClientCallbacks {
            on_connect: Some(on_connect),
            on_receive: Some(on_receive),
            ..Default::default()
        }
    }
}
