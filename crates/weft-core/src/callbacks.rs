use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{error, info};

use crate::{constants::DEFAULT_LAYER, lock, pool::WorkerPool};

/// Factory producing the owning entity as a shared handle.
///
/// Registers are embedded in the entity they belong to, so the factory holds
/// a weak back-reference and upgrades it at dispatch time. It returns `None`
/// only while the owner is being torn down, in which case sharable events
/// are skipped.
pub type SharableFactory<S> = Box<dyn Fn() -> Option<S> + Send + Sync>;

/// Layer storage and worker pool shared by the client and server registers.
///
/// `L` is the per-register callback-set type: a struct of optional callbacks
/// plus their async flags. Mutations lock the layer map; dispatches snapshot
/// the map under the lock and invoke outside it, so a callback may re-enter
/// any register API without deadlocking. Callbacks registered during a
/// dispatch are picked up by the next dispatch.
pub struct RegisterInner<L> {
    layers: Mutex<BTreeMap<String, L>>,
    pool: WorkerPool,
}

impl<L: Default + Clone> RegisterInner<L> {
    /// Creates an empty register whose pool has `workers` threads.
    pub fn new(workers: usize) -> Self {
        Self { layers: Mutex::new(BTreeMap::new()), pool: WorkerPool::new(workers) }
    }

    /// Inserts or replaces a named layer.
    pub fn add_layer(&self, name: &str, layer: L) {
        info!("adding layer: {}", name);
        lock(&self.layers).insert(name.to_string(), layer);
    }

    /// Deletes a layer. Removing a missing layer is a no-op.
    pub fn remove_layer(&self, name: &str) {
        info!("removing layer: {}", name);
        lock(&self.layers).remove(name);
    }

    /// Snapshot of the current layer names.
    pub fn list_layers(&self) -> Vec<String> {
        lock(&self.layers).keys().cloned().collect()
    }

    /// Removes every layer.
    pub fn clear_layers(&self) {
        lock(&self.layers).clear();
        info!("cleared all layers");
    }

    /// Snapshot of the layer set for one dispatch, in stable (name) order.
    pub fn snapshot(&self) -> Vec<L> {
        lock(&self.layers).values().cloned().collect()
    }

    /// Applies a mutation to one layer, implementing the set rule: a missing
    /// default layer is created on the fly; any other missing layer is an
    /// error reported through the trace sink.
    pub fn set_field(&self, layer: &str, event: &str, apply: impl FnOnce(&mut L)) {
        let mut layers = lock(&self.layers);
        if let Some(entry) = layers.get_mut(layer) {
            apply(entry);
            info!("callback {} set on layer {}", event, layer);
        } else if layer == DEFAULT_LAYER {
            info!("default layer {} does not exist, creating it", layer);
            let entry = layers.entry(layer.to_string()).or_default();
            apply(entry);
        } else {
            error!("cannot set callback {} on layer {} because the layer does not exist", event, layer);
        }
    }

    /// The pool executing async-flagged callbacks.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Internal lifecycle hook: starts the pool. Called under the owner's
    /// control mutex.
    pub fn unsafe_start_pool(&self) {
        self.pool.start();
    }

    /// Internal lifecycle hook: stops the pool. Called under the owner's
    /// control mutex.
    pub fn unsafe_stop_pool(&self) {
        self.pool.stop();
    }
}

/// Generates the four setter methods (`set_<event>`, `set_<event>_for`,
/// `set_<event>_async`, `set_<event>_async_for`) for each event of a
/// callback register. The register type must store its layer machinery in a
/// field named `inner` of type [`RegisterInner`].
#[macro_export]
macro_rules! callback_setters {
    ($( $set:ident / $set_for:ident / $set_async:ident / $set_async_for:ident => ($field:ident, $flag:ident): $fnty:ty ),+ $(,)?) => {
        $(
            /// Sets this event's callback on the default layer, creating the
            /// layer if it does not exist yet.
            pub fn $set(&self, callback: $fnty) {
                self.$set_for($crate::constants::DEFAULT_LAYER, callback);
            }

            /// Sets this event's callback on a named layer. Setting on a
            /// missing non-default layer is reported through the trace sink
            /// and otherwise ignored.
            pub fn $set_for(&self, layer: &str, callback: $fnty) {
                self.inner.set_field(layer, stringify!($field), move |entry| {
                    entry.$field = Some(callback);
                });
            }

            /// Marks this event's dispatch as synchronous or asynchronous on
            /// the default layer.
            pub fn $set_async(&self, is_async: bool) {
                self.$set_async_for($crate::constants::DEFAULT_LAYER, is_async);
            }

            /// Marks this event's dispatch as synchronous or asynchronous on
            /// a named layer, with the same missing-layer rule as the
            /// callback setter.
            pub fn $set_async_for(&self, layer: &str, is_async: bool) {
                self.inner.set_field(layer, stringify!($field), move |entry| {
                    entry.$flag = is_async;
                });
            }
        )+
    };
}
