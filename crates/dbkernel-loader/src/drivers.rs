//! Process-wide registry of loaded drivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dbkernel_core::Driver;

use crate::context::ContextId;
use crate::shim::DriverShim;

/// Key of a registered driver: the context it came from plus its unit name.
pub type DriverKey = (ContextId, String);

struct Registered {
    driver: Arc<DriverShim>,
    seq: u64,
}

/// Capability registry for drivers, separate from the module registry.
///
/// Keys include the context id, so two packages can ship a driver unit with
/// the same name without clobbering each other.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<DriverKey, Registered>,
    next_seq: AtomicU64,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` unless one is already registered under the same key.
    ///
    /// Returns the driver that ends up registered.
    pub fn register(&self, driver: Arc<DriverShim>) -> Arc<DriverShim> {
        let key = (driver.context().id(), driver.unit().to_string());
        let entry = self.drivers.entry(key).or_insert_with(|| {
            tracing::debug!(
                unit = driver.unit(),
                context = %driver.context().id(),
                "registered driver"
            );
            Registered {
                driver,
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            }
        });
        entry.driver.clone()
    }

    /// Look up the driver registered for `(context, unit)`.
    pub fn get(&self, context: ContextId, unit: &str) -> Option<Arc<DriverShim>> {
        self.drivers
            .get(&(context, unit.to_string()))
            .map(|r| r.driver.clone())
    }

    /// Remove every driver that came from `context`. Returns how many went.
    pub fn deregister_context(&self, context: ContextId) -> usize {
        let before = self.drivers.len();
        self.drivers.retain(|(ctx, _), _| *ctx != context);
        before - self.drivers.len()
    }

    /// All drivers in registration order.
    pub fn drivers(&self) -> Vec<Arc<DriverShim>> {
        let mut all: Vec<(u64, Arc<DriverShim>)> = self
            .drivers
            .iter()
            .map(|e| (e.value().seq, e.value().driver.clone()))
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, d)| d).collect()
    }

    /// The earliest-registered driver that accepts `url`.
    pub fn driver_for_url(&self, url: &str) -> Option<Arc<DriverShim>> {
        self.drivers().into_iter().find(|d| d.accepts_url(url))
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn clear(&self) {
        self.drivers.clear();
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.len())
            .finish()
    }
}
