//! Concurrent registry of live module instances.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A type-erased, shareable module instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// One entry in the [`ModuleRegistry`].
#[derive(Clone)]
pub struct ModuleRecord {
    /// Registration key.
    pub key: String,
    /// The live instance.
    pub instance: Instance,
    /// Position in registration order.
    pub load_order: u64,
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("key", &self.key)
            .field("load_order", &self.load_order)
            .finish_non_exhaustive()
    }
}

/// Key → instance map shared by the microkernel, the plugin manager and the
/// loader.
///
/// Every `put` takes a fresh load order from a monotonically increasing
/// counter, so re-registering a key never reuses an older value.
#[derive(Default)]
pub struct ModuleRegistry {
    records: DashMap<String, ModuleRecord>,
    next_order: AtomicU64,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `instance` under `key`, replacing any previous instance.
    ///
    /// Returns the load order assigned to this registration.
    pub fn put(&self, key: impl Into<String>, instance: Instance) -> u64 {
        let key = key.into();
        let load_order = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(key = %key, load_order, "registering module");
        self.records.insert(
            key.clone(),
            ModuleRecord {
                key,
                instance,
                load_order,
            },
        );
        load_order
    }

    /// Look up an instance by key.
    pub fn get(&self, key: &str) -> Option<Instance> {
        self.records.get(key).map(|r| r.instance.clone())
    }

    /// Look up an instance by key, returning it only if it is a `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Check whether `key` holds a `T`.
    pub fn satisfies<T: Any + Send + Sync>(&self, key: &str) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| r.instance.is::<T>())
    }

    /// Check whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Remove `key`, returning its instance.
    pub fn remove(&self, key: &str) -> Option<Instance> {
        self.records.remove(key).map(|(_, r)| r.instance)
    }

    /// Load order of the current registration for `key`.
    pub fn load_order_of(&self, key: &str) -> Option<u64> {
        self.records.get(key).map(|r| r.load_order)
    }

    /// Snapshot of all records, sorted by load order.
    pub fn all(&self) -> Vec<ModuleRecord> {
        let mut records: Vec<ModuleRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.load_order);
        records
    }

    /// Registered keys, sorted by load order.
    pub fn keys(&self) -> Vec<String> {
        self.all().into_iter().map(|r| r.key).collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every instance and reset the load order counter.
    ///
    /// Only used during full shutdown.
    pub fn clear(&self) {
        self.records.clear();
        self.next_order.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
