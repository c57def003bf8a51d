//! The dynamic module loader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dbkernel_core::{
    Capability, Event, EventSink, HostExport, LoadError, NullSink, UnitFailure,
    UnitFailureReason, UnitInstance,
};
use tokio::task::JoinHandle;

use crate::context::LoadingContext;
use crate::drivers::DriverRegistry;
use crate::native::NativeOpener;
use crate::package::{PackageOpener, UnitDescriptor};
use crate::pool::WorkerPool;
use crate::progress::{CallbackExecutor, DriverLoadResult, LoadProgress, LoadTracker};
use crate::shim::{ContextShim, DriverShim, PluginShim};

/// A shimmed instance produced by a package.
#[derive(Debug, Clone)]
pub enum LoadedInstance {
    Driver(Arc<DriverShim>),
    Plugin(Arc<PluginShim>),
}

impl LoadedInstance {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Driver(_) => Capability::Driver,
            Self::Plugin(_) => Capability::Plugin,
        }
    }

    pub fn as_driver(&self) -> Option<&Arc<DriverShim>> {
        match self {
            Self::Driver(d) => Some(d),
            Self::Plugin(_) => None,
        }
    }

    pub fn as_plugin(&self) -> Option<&Arc<PluginShim>> {
        match self {
            Self::Plugin(p) => Some(p),
            Self::Driver(_) => None,
        }
    }
}

/// One successfully loaded unit.
///
/// Holding the handle keeps the unit's loading context (and with it any
/// native library) alive.
#[derive(Debug, Clone)]
pub struct LoadedModuleHandle {
    pub package_path: PathBuf,
    pub context: Arc<LoadingContext>,
    pub instance: LoadedInstance,
    /// Unit inside the package the instance was created from.
    pub unit: String,
}

/// Outcome of [`DynamicModuleLoader::load_package`].
#[derive(Debug, Clone)]
pub struct PackageLoad {
    pub package: PathBuf,
    pub context: Arc<LoadingContext>,
    pub handles: Vec<LoadedModuleHandle>,
    /// Units that provide the capability but could not be loaded.
    pub failures: Vec<UnitFailure>,
}

impl PackageLoad {
    /// Names of the loaded units.
    pub fn identifiers(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.unit.clone()).collect()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Loads code packages into isolated contexts and registers their drivers.
pub struct DynamicModuleLoader {
    host: Arc<LoadingContext>,
    openers: Vec<Arc<dyn PackageOpener>>,
    contexts: DashMap<PathBuf, Arc<LoadingContext>>,
    drivers: Arc<DriverRegistry>,
    events: Arc<dyn EventSink>,
}

impl DynamicModuleLoader {
    /// Create a loader whose host context exports `host_exports`.
    ///
    /// Native shared libraries are handled out of the box; add more openers
    /// with [`with_opener`](Self::with_opener).
    pub fn new(host_exports: &[HostExport], drivers: Arc<DriverRegistry>) -> Self {
        Self {
            host: LoadingContext::host(host_exports),
            openers: vec![Arc::new(NativeOpener::new())],
            contexts: DashMap::new(),
            drivers,
            events: Arc::new(NullSink),
        }
    }

    pub fn with_opener(mut self, opener: impl PackageOpener + 'static) -> Self {
        self.openers.push(Arc::new(opener));
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn host_context(&self) -> &Arc<LoadingContext> {
        &self.host
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Check whether some opener understands `path`.
    pub fn handles(&self, path: &Path) -> bool {
        self.opener_for(path).is_some()
    }

    fn opener_for(&self, path: &Path) -> Option<&Arc<dyn PackageOpener>> {
        self.openers.iter().find(|o| o.handles(path))
    }

    /// Get the loading context for `path`, opening the package on first use.
    ///
    /// Contexts are cached by canonical path.
    pub fn open_context(&self, path: &Path) -> Result<Arc<LoadingContext>, LoadError> {
        let canonical = path.canonicalize().map_err(|e| LoadError::io(path, e))?;

        if let Some(ctx) = self.contexts.get(&canonical) {
            tracing::debug!(package = %canonical.display(), context = %ctx.id(), "reusing loading context");
            return Ok(ctx.clone());
        }

        let opener = self
            .opener_for(&canonical)
            .ok_or_else(|| LoadError::Unsupported {
                path: canonical.clone(),
            })?;
        let opened = opener.open(&canonical)?;

        // A racing open may have won; its context is kept and ours dropped.
        let ctx = self
            .contexts
            .entry(canonical.clone())
            .or_insert_with(|| LoadingContext::for_package(canonical, self.host.clone(), opened))
            .clone();
        Ok(ctx)
    }

    /// Cached context for `path`, if the package was opened.
    pub fn context_for(&self, path: &Path) -> Option<Arc<LoadingContext>> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.contexts.get(&key).map(|c| c.clone())
    }

    /// All cached contexts, oldest first.
    pub fn cached_contexts(&self) -> Vec<Arc<LoadingContext>> {
        let mut all: Vec<_> = self.contexts.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Inspect a unit without running any of its code.
    fn check_unit(
        ctx: &LoadingContext,
        unit: &UnitDescriptor,
        capability: Capability,
    ) -> Result<(), UnitFailureReason> {
        if let Some(symbol) = unit
            .required_symbols()
            .iter()
            .find(|s| ctx.resolve(s).is_none())
        {
            return Err(UnitFailureReason::UnresolvedSymbol {
                symbol: symbol.clone(),
            });
        }
        if !unit.implements(capability) {
            return Err(UnitFailureReason::MissingCapability {
                capability: capability.to_string(),
            });
        }
        if unit.is_abstract() {
            return Err(UnitFailureReason::Abstract);
        }
        Ok(())
    }

    /// Instantiate `unit` from `ctx` as `capability` and wrap it in a shim.
    ///
    /// The instance is not registered anywhere.
    pub fn instantiate(
        &self,
        ctx: &Arc<LoadingContext>,
        unit: &str,
        capability: Capability,
    ) -> Result<LoadedInstance, LoadError> {
        let package = ctx.package_path().map(Path::to_path_buf).unwrap_or_default();
        if ctx.is_closed() {
            return Err(LoadError::ContextClosed { path: package });
        }

        let descriptor = ctx.unit(unit).ok_or_else(|| LoadError::UnitNotFound {
            path: package.clone(),
            unit: unit.to_string(),
        })?;
        let unit_error = |reason| LoadError::Unit {
            unit: unit.to_string(),
            reason,
        };

        Self::check_unit(ctx, descriptor, capability).map_err(unit_error)?;

        let instance = {
            let _guard = ctx.enter();
            descriptor.instantiate().map_err(unit_error)?
        };

        match (capability, instance) {
            (Capability::Driver, UnitInstance::Driver(driver)) => Ok(LoadedInstance::Driver(
                Arc::new(ContextShim::new(driver, unit, ctx.clone())),
            )),
            (Capability::Plugin, UnitInstance::Plugin(plugin)) => Ok(LoadedInstance::Plugin(
                Arc::new(ContextShim::new(plugin, unit, ctx.clone())),
            )),
            (capability, _) => Err(unit_error(UnitFailureReason::MissingCapability {
                capability: capability.to_string(),
            })),
        }
    }

    /// Load every driver in the package at `path`.
    ///
    /// Only outer failures (missing or unreadable package) are errors. Units
    /// that do not provide the driver capability are ignored; units that do
    /// but cannot load are reported in [`PackageLoad::failures`].
    pub fn load_package(&self, path: &Path) -> Result<PackageLoad, LoadError> {
        let ctx = self.open_context(path)?;
        let package = ctx
            .package_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());

        let mut handles = Vec::new();
        let mut failures = Vec::new();

        for unit in ctx.units() {
            if let Some(existing) = self.drivers.get(ctx.id(), unit.name()) {
                handles.push(LoadedModuleHandle {
                    package_path: package.clone(),
                    context: ctx.clone(),
                    instance: LoadedInstance::Driver(existing),
                    unit: unit.name().to_string(),
                });
                continue;
            }

            let loaded = match Self::check_unit(&ctx, unit, Capability::Driver) {
                Err(UnitFailureReason::MissingCapability { .. }) => continue,
                Err(reason) => Err(reason),
                Ok(()) => match self.instantiate(&ctx, unit.name(), Capability::Driver) {
                    Ok(instance) => Ok(instance),
                    Err(LoadError::Unit { reason, .. }) => Err(reason),
                    Err(e) => return Err(e),
                },
            };

            match loaded {
                Ok(LoadedInstance::Driver(shim)) => {
                    let shim = self.drivers.register(shim);
                    handles.push(LoadedModuleHandle {
                        package_path: package.clone(),
                        context: ctx.clone(),
                        instance: LoadedInstance::Driver(shim),
                        unit: unit.name().to_string(),
                    });
                }
                Ok(LoadedInstance::Plugin(_)) => {}
                Err(reason) => {
                    tracing::warn!(
                        package = %package.display(),
                        unit = unit.name(),
                        %reason,
                        "skipping unit"
                    );
                    failures.push(UnitFailure::new(&package, unit.name(), reason));
                }
            }
        }

        tracing::debug!(
            package = %package.display(),
            loaded = handles.len(),
            failed = failures.len(),
            "loaded package"
        );

        let load = PackageLoad {
            package,
            context: ctx,
            handles,
            failures,
        };
        if !load.handles.is_empty() {
            self.events.emit(Event::DriverLoaded {
                package: load.package.clone(),
                drivers: load.identifiers(),
            });
        }
        Ok(load)
    }

    /// Package files in `dir` some opener understands, sorted by name.
    pub fn list_packages(&self, dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
        let mut packages = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| LoadError::io(dir, e))? {
            let path = entry.map_err(|e| LoadError::io(dir, e))?.path();
            if path.is_file() && self.handles(&path) {
                packages.push(path);
            }
        }
        packages.sort();
        Ok(packages)
    }

    /// Load every package in `dir`, reporting progress per package.
    fn load_dir(
        &self,
        dir: &Path,
        mut on_progress: impl FnMut(LoadProgress),
    ) -> Result<DriverLoadResult, LoadError> {
        let packages = self.list_packages(dir)?;
        let mut tracker = LoadTracker::new(packages.len());

        for (index, path) in packages.into_iter().enumerate() {
            on_progress(tracker.progress(index, path.clone()));

            match self.load_package(&path) {
                Ok(load) if !load.handles.is_empty() => {
                    tracker.record_success(load.identifiers());
                    tracker.record_unit_failures(load.failures);
                }
                Ok(load) => {
                    tracker.record_package_failure(path);
                    tracker.record_unit_failures(load.failures);
                }
                Err(e) => {
                    tracing::warn!(package = %path.display(), error = %e, "failed to load package");
                    tracker.record_package_failure(path);
                }
            }
        }

        let result = tracker.finish();
        tracing::info!(dir = %dir.display(), "{}", result.message);
        Ok(result)
    }

    /// Load every package in `dir` on the calling thread.
    pub fn load_all_packages(&self, dir: &Path) -> Result<DriverLoadResult, LoadError> {
        self.load_dir(dir, |_| {})
    }

    /// Load every package in `dir` on the worker pool.
    ///
    /// `on_progress` fires once per package, in order, before it loads;
    /// `on_complete` fires once at the end. Both run through `executor`.
    pub fn load_all_packages_async<P, C>(
        self: &Arc<Self>,
        dir: impl Into<PathBuf>,
        pool: &WorkerPool,
        executor: Arc<dyn CallbackExecutor>,
        on_progress: P,
        on_complete: C,
    ) -> JoinHandle<()>
    where
        P: Fn(LoadProgress) + Send + Sync + 'static,
        C: FnOnce(DriverLoadResult) + Send + 'static,
    {
        let loader = self.clone();
        let dir = dir.into();
        let on_progress = Arc::new(on_progress);

        pool.spawn_blocking(move || {
            let result = loader
                .load_dir(&dir, |progress| {
                    let on_progress = on_progress.clone();
                    executor.execute(Box::new(move || on_progress(progress)));
                })
                .unwrap_or_else(|e| {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to list driver packages");
                    DriverLoadResult {
                        failure_count: 1,
                        message: e.to_string(),
                        failed_packages: vec![dir.clone()],
                        ..Default::default()
                    }
                });
            executor.execute(Box::new(move || on_complete(result)));
        })
    }

    /// Close the context for `path`, drop it from the cache and deregister
    /// its drivers. Live instances keep their context alive until dropped.
    pub fn release(&self, path: &Path) -> bool {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        match self.contexts.remove(&key) {
            Some((_, ctx)) => {
                ctx.close();
                let removed = self.drivers.deregister_context(ctx.id());
                tracing::debug!(package = %key.display(), drivers = removed, "released package");
                true
            }
            None => false,
        }
    }

    /// Release every cached context. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let paths: Vec<PathBuf> = self.contexts.iter().map(|e| e.key().clone()).collect();
        paths.iter().filter(|p| self.release(p)).count()
    }
}

impl std::fmt::Debug for DynamicModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicModuleLoader")
            .field("openers", &self.openers.iter().map(|o| o.name()).collect::<Vec<_>>())
            .field("contexts", &self.contexts.len())
            .field("drivers", &self.drivers.len())
            .finish()
    }
}
