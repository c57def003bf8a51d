//! Operator-facing plugin manager.
//!
//! The manager owns the plugin catalog, persists install/enable flags, and
//! loads plugins out of their packages through the [`DynamicModuleLoader`].
//! Every start runs on a dedicated [`PluginWorker`]. Unlike the
//! [`Microkernel`](crate::Microkernel), it does not order plugins by their
//! dependencies.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dbkernel_core::{
    Capability, Event, EventSink, HostConfig, Instance, KernelResult, ModuleRegistry, Plugin,
    PluginDescriptor, PluginError, PluginManifest, PluginStatus,
};
use dbkernel_loader::{DynamicModuleLoader, PluginShim, WorkerPool};
use parking_lot::{Mutex, RwLock};

use crate::manifest::{ManifestSource, ManifestStore};
use crate::worker::PluginWorker;

struct Inner {
    config: HostConfig,
    store: ManifestStore,
    manifest: RwLock<PluginManifest>,
    loader: Arc<DynamicModuleLoader>,
    registry: Arc<ModuleRegistry>,
    events: Arc<dyn EventSink>,
    loaded: DashMap<String, Arc<PluginShim>>,
    workers: Mutex<HashMap<String, PluginWorker>>,
}

impl Inner {
    fn status(&self, id: &str) -> Option<PluginStatus> {
        self.manifest.read().get(id).map(|p| p.status)
    }

    fn set_status(&self, id: &str, status: PluginStatus) {
        if let Some(plugin) = self.manifest.write().get_mut(id) {
            tracing::debug!(plugin = id, %status, "plugin status");
            plugin.status = status;
        }
    }

    fn settle_status(&self, id: &str) {
        if let Some(plugin) = self.manifest.write().get_mut(id) {
            plugin.reset_status();
        }
    }

    fn fail(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(plugin = id, %message, "plugin error");
        self.set_status(id, PluginStatus::Error);
        self.events.emit(Event::PluginError {
            id: id.to_string(),
            message,
        });
    }

    fn persist(&self) -> KernelResult<()> {
        let mut manifest = self.manifest.write();
        manifest.touch();
        self.store.save_manifest(&manifest)?;
        self.store.save_installed_state(&manifest)
    }

    fn package_path(&self, descriptor: &PluginDescriptor) -> Option<PathBuf> {
        descriptor
            .package_path
            .as_ref()
            .filter(|_| descriptor.has_package())
            .map(|p| self.config.resolve_plugin_package(p))
    }

    fn load_plugin(&self, descriptor: &PluginDescriptor) -> Option<Arc<PluginShim>> {
        let id = descriptor.id.as_str();
        if let Some(shim) = self.loaded.get(id) {
            return Some(shim.clone());
        }

        self.set_status(id, PluginStatus::Loading);
        match self.try_load(descriptor) {
            Ok(shim) => {
                self.registry.put(id, shim.clone() as Instance);
                self.loaded.insert(id.to_string(), shim.clone());
                self.settle_status(id);
                self.events.emit(Event::PluginLoaded { id: id.to_string() });
                tracing::info!(plugin = id, entry = %descriptor.entry_point, "loaded plugin");
                Some(shim)
            }
            Err(message) => {
                self.fail(id, message);
                None
            }
        }
    }

    fn try_load(&self, descriptor: &PluginDescriptor) -> Result<Arc<PluginShim>, String> {
        let path = self
            .package_path(descriptor)
            .ok_or_else(|| "descriptor has no package".to_string())?;
        if descriptor.entry_point.is_empty() {
            return Err("descriptor has no entry point".to_string());
        }

        let ctx = self.loader.open_context(&path).map_err(|e| e.to_string())?;
        let instance = self
            .loader
            .instantiate(&ctx, &descriptor.entry_point, Capability::Plugin)
            .map_err(|e| e.to_string())?;
        let shim = instance
            .as_plugin()
            .cloned()
            .ok_or_else(|| format!("'{}' is not a plugin", descriptor.entry_point))?;

        catch_unwind(AssertUnwindSafe(|| shim.initialize()))
            .unwrap_or_else(|p| Err(PluginError::from_panic(p)))
            .map_err(|e| format!("initialize failed: {e}"))?;
        Ok(shim)
    }

    fn spawn_worker(self: &Arc<Self>, id: &str, shim: Arc<PluginShim>) -> bool {
        let report_inner = self.clone();
        let report_id = id.to_string();
        let report = move |result: Result<(), PluginError>| {
            if let Err(error) = result {
                if report_inner.status(&report_id) == Some(PluginStatus::Running) {
                    report_inner.fail(&report_id, format!("start failed: {error}"));
                }
            }
        };

        // Running before the worker exists, so an immediate failure in
        // `start` is never overwritten.
        self.set_status(id, PluginStatus::Running);
        match PluginWorker::spawn(id, move |ctx| shim.start(ctx), report) {
            Ok(worker) => {
                self.workers.lock().insert(id.to_string(), worker);
                self.events.emit(Event::PluginStarted { id: id.to_string() });
                tracing::info!(plugin = id, "started plugin");
                true
            }
            Err(error) => {
                self.fail(id, error.to_string());
                false
            }
        }
    }

    /// Blocking part of a stop. Returns `false` if `stop()` failed.
    fn stop_blocking(
        &self,
        id: &str,
        worker: Option<PluginWorker>,
        shim: Option<Arc<PluginShim>>,
    ) -> bool {
        if let Some(worker) = &worker {
            worker.cancel();
        }

        let mut ok = true;
        if let Some(shim) = shim {
            let outcome = catch_unwind(AssertUnwindSafe(|| shim.stop()))
                .unwrap_or_else(|p| Err(PluginError::from_panic(p)));
            if let Err(error) = outcome {
                self.fail(id, format!("stop failed: {error}"));
                ok = false;
            }
        }

        if let Some(worker) = worker {
            worker.join(self.config.stop_timeout());
        }

        if ok {
            self.settle_status(id);
        }
        self.events.emit(Event::PluginStopped { id: id.to_string() });
        tracing::info!(plugin = id, "stopped plugin");
        ok
    }
}

/// Catalog, install state and lifecycle of plugins.
pub struct PluginManager {
    inner: Arc<Inner>,
    pool: WorkerPool,
}

impl PluginManager {
    pub fn new(
        config: HostConfig,
        loader: Arc<DynamicModuleLoader>,
        registry: Arc<ModuleRegistry>,
        pool: WorkerPool,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let store = ManifestStore::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                manifest: RwLock::new(PluginManifest::empty()),
                loader,
                registry,
                events,
                loaded: DashMap::new(),
                workers: Mutex::new(HashMap::new()),
            }),
            pool,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ManifestStore {
        &self.inner.store
    }

    // ==================== Catalog ====================

    /// Load the catalog (disk, else bundled default, else empty).
    pub fn load_manifest(&self) -> ManifestSource {
        let (manifest, source) = self.inner.store.load();
        *self.inner.manifest.write() = manifest;
        source
    }

    pub fn save_manifest(&self) -> KernelResult<()> {
        let mut manifest = self.inner.manifest.write();
        manifest.touch();
        self.inner.store.save_manifest(&manifest)
    }

    pub fn save_installed_state(&self) -> KernelResult<()> {
        self.inner.store.save_installed_state(&self.inner.manifest.read())
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.inner.manifest.read().plugins.clone()
    }

    pub fn plugin(&self, id: &str) -> Option<PluginDescriptor> {
        self.inner.manifest.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<PluginStatus> {
        self.inner.status(id)
    }

    /// Plugins whose category matches (case-insensitive).
    pub fn plugins_in_category(&self, category: &str) -> Vec<PluginDescriptor> {
        self.inner
            .manifest
            .read()
            .plugins
            .iter()
            .filter(|p| p.category.eq_ignore_ascii_case(category))
            .cloned()
            .collect()
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .inner
            .manifest
            .read()
            .plugins
            .iter()
            .filter(|p| !p.category.is_empty())
            .map(|p| p.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    // ==================== Install state ====================

    /// Mark a plugin installed.
    ///
    /// Returns `Ok(false)` when the descriptor has no package or the package
    /// is missing; only persistence failures are errors.
    pub fn install_plugin(&self, mut descriptor: PluginDescriptor) -> KernelResult<bool> {
        let Some(path) = self.inner.package_path(&descriptor) else {
            tracing::warn!(plugin = %descriptor.id, "cannot install plugin without a package");
            return Ok(false);
        };
        if !path.is_file() {
            tracing::warn!(plugin = %descriptor.id, package = %path.display(), "plugin package not found");
            return Ok(false);
        }

        let id = descriptor.id.clone();
        descriptor.installed = true;
        descriptor.reset_status();
        self.inner.manifest.write().upsert(descriptor);
        self.inner.persist()?;

        self.inner.events.emit(Event::PluginInstalled { id: id.clone() });
        tracing::info!(plugin = %id, "installed plugin");
        Ok(true)
    }

    /// Stop, release and mark a plugin not installed. Idempotent.
    pub async fn uninstall_plugin(&self, id: &str) -> KernelResult<bool> {
        self.stop_plugin(id).await;

        self.inner.loaded.remove(id);
        self.inner.registry.remove(id);
        if let Some(path) = self.plugin(id).and_then(|d| self.inner.package_path(&d)) {
            self.inner.loader.release(&path);
        }

        if let Some(plugin) = self.inner.manifest.write().get_mut(id) {
            plugin.installed = false;
            plugin.reset_status();
        }
        self.inner.persist()?;

        self.inner.events.emit(Event::PluginUninstalled { id: id.to_string() });
        tracing::info!(plugin = id, "uninstalled plugin");
        Ok(true)
    }

    /// Returns `Ok(false)` for unknown ids.
    pub fn enable_plugin(&self, id: &str) -> KernelResult<bool> {
        {
            let mut manifest = self.inner.manifest.write();
            let Some(plugin) = manifest.get_mut(id) else {
                return Ok(false);
            };
            plugin.enabled = true;
            if !plugin.status.is_active() {
                plugin.reset_status();
            }
        }
        self.inner.persist()?;
        Ok(true)
    }

    /// Stop if running, then disable. Returns `Ok(false)` for unknown ids.
    pub async fn disable_plugin(&self, id: &str) -> KernelResult<bool> {
        if self.plugin(id).is_none() {
            return Ok(false);
        }
        self.stop_plugin(id).await;
        if let Some(plugin) = self.inner.manifest.write().get_mut(id) {
            plugin.enabled = false;
            plugin.reset_status();
        }
        self.inner.persist()?;
        Ok(true)
    }

    // ==================== Lifecycle ====================

    /// Load and initialize a plugin's entry unit, or return the cached
    /// instance. Failures set `ERROR` and return `None`.
    pub fn load_plugin(&self, descriptor: &PluginDescriptor) -> Option<Arc<PluginShim>> {
        self.inner.load_plugin(descriptor)
    }

    /// Start a plugin on its own worker. Idempotent while running.
    ///
    /// Returns once the plugin's worker is running; a failure inside
    /// `start()` later flips the status to `ERROR`.
    pub async fn start_plugin(&self, id: &str) -> bool {
        let Some(descriptor) = self.plugin(id) else {
            tracing::warn!(plugin = id, "unknown plugin");
            return false;
        };
        if descriptor.status == PluginStatus::Running {
            return true;
        }
        if !descriptor.installed || !descriptor.enabled {
            tracing::warn!(
                plugin = id,
                installed = descriptor.installed,
                enabled = descriptor.enabled,
                "plugin not startable"
            );
            return false;
        }

        // A previous run may have left a finished worker behind.
        if let Some(old) = self.inner.workers.lock().remove(id) {
            old.cancel();
        }

        let inner = self.inner.clone();
        let loaded = self
            .pool
            .spawn_blocking(move || inner.load_plugin(&descriptor))
            .await;
        match loaded {
            Ok(Some(shim)) => self.inner.spawn_worker(id, shim),
            Ok(None) => false,
            Err(e) => {
                self.inner.fail(id, format!("load task failed: {e}"));
                false
            }
        }
    }

    /// Stop a plugin. Idempotent: stopping a plugin that is not running
    /// succeeds.
    pub async fn stop_plugin(&self, id: &str) -> bool {
        let worker = self.inner.workers.lock().remove(id);
        let running = self.status(id) == Some(PluginStatus::Running);
        if worker.is_none() && !running {
            return true;
        }

        let shim = self.inner.loaded.get(id).map(|s| s.clone());
        let inner = self.inner.clone();
        let plugin_id = id.to_string();
        self.pool
            .spawn_blocking(move || inner.stop_blocking(&plugin_id, worker, shim))
            .await
            .unwrap_or(false)
    }

    /// Start every installed and enabled plugin. Each start is independent.
    ///
    /// Returns `(id, started)` per attempted plugin, in catalog order.
    pub async fn start_all_enabled_plugins(&self) -> Vec<(String, bool)> {
        let ids: Vec<String> = self
            .inner
            .manifest
            .read()
            .plugins
            .iter()
            .filter(|p| p.installed && p.enabled)
            .map(|p| p.id.clone())
            .collect();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let started = self.start_plugin(&id).await;
            results.push((id, started));
        }
        results
    }

    /// Ids of plugins with a live worker or `RUNNING` status.
    pub fn running_plugins(&self) -> Vec<String> {
        let workers = self.inner.workers.lock();
        self.inner
            .manifest
            .read()
            .plugins
            .iter()
            .filter(|p| p.status == PluginStatus::Running || workers.contains_key(&p.id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Stop everything, release all contexts, persist the installed state and
    /// drain the worker pool.
    pub async fn shutdown(&self) {
        for id in self.running_plugins() {
            self.stop_plugin(&id).await;
        }

        for entry in self.inner.loaded.iter() {
            self.inner.registry.remove(entry.key());
        }
        self.inner.loaded.clear();
        let released = self.inner.loader.release_all();

        if let Err(e) = self.save_installed_state() {
            tracing::error!(error = %e, "failed to persist installed plugins");
        }

        self.pool.shutdown(self.inner.config.pool_shutdown_timeout()).await;
        tracing::info!(released, "plugin manager shut down");
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.inner.manifest.read().plugins.len())
            .field("loaded", &self.inner.loaded.len())
            .finish()
    }
}
