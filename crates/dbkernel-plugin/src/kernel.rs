//! The plugin microkernel.
//!
//! Modules are registered as [`ModuleDefinition`]s, ordered by their declared
//! dependencies, instantiated one by one with their dependencies injected from
//! the [`ModuleRegistry`], and then started concurrently, each on its own
//! [`PluginWorker`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dbkernel_core::{
    Event, EventSink, HostConfig, KernelError, KernelResult, ModuleRegistry, PluginError,
    PluginResult,
};
use dbkernel_loader::WorkerPool;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::graph::{DependencyGraph, TopologicalOrder};
use crate::module::{DependencyProvider, DependencySet, Module, ModuleDefinition};
use crate::worker::PluginWorker;

/// Lifecycle state of a module id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unregistered,
    Registered,
    Instantiated,
    Started,
    Stopped,
    Failed,
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Instantiated => "instantiated",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of [`Microkernel::start_all_plugins`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    /// The order modules were started in.
    pub order: Vec<String>,
    /// Modules whose start completed.
    pub started: Vec<String>,
    /// Modules that failed, with the reason.
    pub failed: Vec<(String, String)>,
    /// Modules still inside `start()` when the start timeout ran out. They
    /// keep running on their workers.
    pub pending: Vec<String>,
}

impl StartReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// State shared with pool tasks and plugin workers.
struct Shared {
    registry: Arc<ModuleRegistry>,
    events: Arc<dyn EventSink>,
    states: DashMap<String, ModuleState>,
    modules: DashMap<String, Arc<dyn Module>>,
    workers: Mutex<HashMap<String, PluginWorker>>,
    stop_timeout: Duration,
}

impl Shared {
    fn state(&self, id: &str) -> ModuleState {
        self.states
            .get(id)
            .map_or(ModuleState::Unregistered, |s| *s)
    }

    fn set_state(&self, id: &str, state: ModuleState) {
        tracing::debug!(module = id, %state, "module state");
        self.states.insert(id.to_string(), state);
    }

    fn fail(&self, id: &str, error: &PluginError) {
        tracing::error!(module = id, %error, "module failed");
        self.set_state(id, ModuleState::Failed);
        self.events.emit(Event::PluginError {
            id: id.to_string(),
            message: error.to_string(),
        });
    }

    /// Build, register and run the startup hooks of one module.
    fn instantiate(&self, definition: &ModuleDefinition) -> PluginResult<Arc<dyn Module>> {
        let id = definition.id();
        let deps = DependencySet::resolve(&self.registry, definition.dependencies());
        let missing = deps.missing();
        if !missing.is_empty() {
            tracing::debug!(module = id, ?missing, "dependencies not available, injecting none");
        }

        let instance = definition.instantiate(&deps)?;
        self.registry.put(id, instance.instance().clone());
        let module = instance.module().clone();
        self.modules.insert(id.to_string(), module.clone());
        self.set_state(id, ModuleState::Instantiated);

        for hook in module.startup_hooks() {
            let outcome = catch_unwind(AssertUnwindSafe(|| module.invoke_startup(hook)))
                .unwrap_or_else(|p| Err(PluginError::from_panic(p)));
            if let Err(error) = outcome {
                tracing::warn!(module = id, hook, %error, "startup hook failed");
            }
        }

        Ok(module)
    }

    /// Start an instantiated module. The receiver resolves once `start()`
    /// returns.
    fn launch(self: &Arc<Self>, id: &str, module: Arc<dyn Module>) -> oneshot::Receiver<PluginResult<()>> {
        let (tx, rx) = oneshot::channel();

        if module.as_plugin().is_none() {
            self.set_state(id, ModuleState::Started);
            self.events.emit(Event::PluginStarted { id: id.to_string() });
            let _ = tx.send(Ok(()));
            return rx;
        }

        let run_shared = self.clone();
        let run_id = id.to_string();
        let run = move |ctx: &dbkernel_core::RunContext| {
            let Some(plugin) = module.as_plugin() else {
                return Ok(());
            };
            plugin.initialize()?;
            run_shared.set_state(&run_id, ModuleState::Started);
            run_shared.events.emit(Event::PluginStarted { id: run_id.clone() });
            plugin.start(ctx)
        };

        let report_shared = self.clone();
        let report_id = id.to_string();
        let report = move |result: PluginResult<()>| {
            if let Err(error) = &result {
                // A stop already settled the state; a late error is noise.
                if matches!(
                    report_shared.state(&report_id),
                    ModuleState::Instantiated | ModuleState::Started
                ) {
                    report_shared.fail(&report_id, error);
                }
            }
            let _ = tx.send(result);
        };

        match PluginWorker::spawn(id, run, report) {
            Ok(worker) => {
                self.workers.lock().insert(id.to_string(), worker);
            }
            Err(error) => {
                // `report` was dropped with the closure; the receiver sees
                // a closed channel.
                self.fail(id, &error);
            }
        }
        rx
    }

    /// Stop one module. Returns `false` if it was not live.
    ///
    /// A module that already failed keeps its `Failed` state.
    fn stop(&self, id: &str) -> bool {
        let previous = self.state(id);
        let worker = self.workers.lock().remove(id);
        let Some((_, module)) = self.modules.remove(id) else {
            if let Some(worker) = worker {
                worker.cancel();
            }
            return false;
        };

        if let Some(worker) = &worker {
            worker.cancel();
        }

        let mut failed = false;
        if let Some(plugin) = module.as_plugin() {
            let outcome = catch_unwind(AssertUnwindSafe(|| plugin.stop()))
                .unwrap_or_else(|p| Err(PluginError::from_panic(p)));
            if let Err(error) = outcome {
                self.fail(id, &error);
                failed = true;
            }
        }

        if let Some(worker) = worker {
            worker.join(self.stop_timeout);
        }

        self.registry.remove(id);
        if !failed && previous != ModuleState::Failed {
            self.set_state(id, ModuleState::Stopped);
        }
        self.events.emit(Event::PluginStopped { id: id.to_string() });
        true
    }

    /// Stop `order` in reverse, then whatever is still live, newest
    /// registration first.
    fn stop_in_order(&self, order: &[String]) -> Vec<String> {
        let mut stopped: Vec<String> = order
            .iter()
            .rev()
            .filter(|id| self.stop(id))
            .cloned()
            .collect();

        let mut remaining: Vec<(u64, String)> = self
            .modules
            .iter()
            .map(|entry| {
                let id = entry.key().clone();
                (self.registry.load_order_of(&id).unwrap_or(0), id)
            })
            .collect();
        remaining.sort_by(|a, b| b.0.cmp(&a.0));
        stopped.extend(
            remaining
                .into_iter()
                .map(|(_, id)| id)
                .filter(|id| self.stop(id)),
        );
        stopped
    }

    /// Cancel and join workers whose module is already gone.
    fn join_orphans(&self) {
        let orphans: Vec<PluginWorker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in orphans {
            worker.cancel();
            worker.join(self.stop_timeout);
        }
    }
}

/// Dependency-ordered module host.
pub struct Microkernel {
    shared: Arc<Shared>,
    pool: WorkerPool,
    definitions: RwLock<IndexMap<String, ModuleDefinition>>,
    providers: Mutex<Vec<Arc<dyn DependencyProvider>>>,
    graph: RwLock<Option<DependencyGraph>>,
    start_order: Mutex<Vec<String>>,
    start_timeout: Duration,
    pool_shutdown_timeout: Duration,
}

impl Microkernel {
    pub fn new(
        config: &HostConfig,
        registry: Arc<ModuleRegistry>,
        pool: WorkerPool,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                events,
                states: DashMap::new(),
                modules: DashMap::new(),
                workers: Mutex::new(HashMap::new()),
                stop_timeout: config.stop_timeout(),
            }),
            pool,
            definitions: RwLock::new(IndexMap::new()),
            providers: Mutex::new(Vec::new()),
            graph: RwLock::new(None),
            start_order: Mutex::new(Vec::new()),
            start_timeout: config.start_timeout(),
            pool_shutdown_timeout: config.pool_shutdown_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.shared.registry
    }

    /// Run the providers, then register the module definitions.
    ///
    /// Returns how many provider instances were registered.
    pub fn initialize(
        &self,
        modules: impl IntoIterator<Item = ModuleDefinition>,
        providers: impl IntoIterator<Item = Arc<dyn DependencyProvider>>,
    ) -> usize {
        let mut provided = 0;
        let mut held = self.providers.lock();
        for provider in providers {
            for factory in provider.factories() {
                let (key, result) = factory.build();
                match result {
                    Ok(instance) => {
                        self.shared.registry.put(key, instance);
                        provided += 1;
                    }
                    Err(error) => {
                        tracing::warn!(provider = provider.name(), %key, %error, "dependency factory failed");
                    }
                }
            }
            held.push(provider);
        }
        drop(held);

        let mut definitions = self.definitions.write();
        for definition in modules {
            let id = definition.id().to_string();
            if definitions.insert(id.clone(), definition).is_some() {
                tracing::warn!(module = %id, "module registered twice, keeping the last definition");
            }
            self.shared.set_state(&id, ModuleState::Registered);
        }
        *self.graph.write() = None;

        tracing::debug!(modules = definitions.len(), provided, "microkernel initialized");
        provided
    }

    /// Rebuild the graph from the declared dependencies.
    pub fn build_dependency_graph(&self) -> DependencyGraph {
        let definitions = self.definitions.read();
        let mut graph = DependencyGraph::new();
        for id in definitions.keys() {
            graph.add_node(id.clone());
        }
        for (id, definition) in definitions.iter() {
            for dep in definition.dependencies() {
                graph.add_edge(id.clone(), dep.clone());
            }
        }
        *self.graph.write() = Some(graph.clone());
        graph
    }

    fn sorted(&self) -> TopologicalOrder {
        let cached = self.graph.read().clone();
        let graph = match cached {
            Some(graph) => graph,
            None => self.build_dependency_graph(),
        };
        graph.topological_order()
    }

    /// Module ids, dependencies first. Keys that only name provided
    /// instances are left out.
    pub fn initialization_order(&self) -> Vec<String> {
        let definitions = self.definitions.read();
        self.sorted()
            .order
            .into_iter()
            .filter(|id| definitions.contains_key(id))
            .collect()
    }

    pub fn state(&self, id: &str) -> ModuleState {
        self.shared.state(id)
    }

    /// All known module ids with their states, in registration order.
    pub fn states(&self) -> Vec<(String, ModuleState)> {
        self.definitions
            .read()
            .keys()
            .map(|id| (id.clone(), self.shared.state(id)))
            .collect()
    }

    /// Order modules were started in: the last `start_all_plugins` call,
    /// followed by modules started on their own since.
    pub fn last_start_order(&self) -> Vec<String> {
        self.start_order.lock().clone()
    }

    async fn instantiate_on_pool(&self, definition: ModuleDefinition) -> PluginResult<Arc<dyn Module>> {
        let shared = self.shared.clone();
        self.pool
            .spawn_blocking(move || shared.instantiate(&definition))
            .await
            .unwrap_or_else(|e| Err(PluginError::failed(format!("instantiation task failed: {e}"))))
    }

    async fn collect(
        &self,
        launched: Vec<(String, oneshot::Receiver<PluginResult<()>>)>,
        report: &mut StartReport,
    ) {
        let deadline = tokio::time::Instant::now() + self.start_timeout;
        for (id, rx) in launched {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(Ok(()))) => report.started.push(id),
                Ok(Ok(Err(error))) => report.failed.push((id, error.to_string())),
                Ok(Err(_)) => report.failed.push((id, "worker exited without reporting".to_string())),
                Err(_) => {
                    tracing::warn!(module = %id, "start still running after timeout");
                    report.pending.push(id);
                }
            }
        }
    }

    /// Instantiate every registered module in dependency order and start it.
    ///
    /// One module failing never prevents the others from starting.
    pub async fn start_all_plugins(&self) -> StartReport {
        let order = self.initialization_order();
        *self.start_order.lock() = order.clone();

        let mut report = StartReport {
            order: order.clone(),
            ..Default::default()
        };
        let mut launched = Vec::new();

        for id in order {
            if matches!(self.state(&id), ModuleState::Instantiated | ModuleState::Started) {
                report.started.push(id);
                continue;
            }
            let Some(definition) = self.definitions.read().get(&id).cloned() else {
                continue;
            };
            match self.instantiate_on_pool(definition).await {
                Ok(module) => {
                    let rx = self.shared.launch(&id, module);
                    launched.push((id, rx));
                }
                Err(error) => {
                    self.shared.fail(&id, &error);
                    report.failed.push((id, error.to_string()));
                }
            }
        }

        self.collect(launched, &mut report).await;
        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            "modules started"
        );
        report
    }

    /// Instantiate and start one module. Idempotent while it is live.
    pub async fn start_plugin(&self, id: &str) -> KernelResult<ModuleState> {
        let current = self.state(id);
        if matches!(current, ModuleState::Instantiated | ModuleState::Started) {
            return Ok(current);
        }

        let definition = self
            .definitions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::config(format!("Unknown module '{id}'")))?;

        let module = match self.instantiate_on_pool(definition).await {
            Ok(module) => module,
            Err(error) => {
                self.shared.fail(id, &error);
                return Err(KernelError::Lifecycle {
                    id: id.to_string(),
                    source: error,
                });
            }
        };

        {
            let mut order = self.start_order.lock();
            if !order.iter().any(|known| known == id) {
                order.push(id.to_string());
            }
        }

        let mut report = StartReport::default();
        let rx = self.shared.launch(id, module);
        self.collect(vec![(id.to_string(), rx)], &mut report).await;

        match report.failed.pop() {
            Some((_, message)) => Err(KernelError::Lifecycle {
                id: id.to_string(),
                source: PluginError::failed(message),
            }),
            None => Ok(self.state(id)),
        }
    }

    /// Stop one module and remove it from the registry.
    pub fn stop_plugin(&self, id: &str) -> bool {
        self.shared.stop(id)
    }

    /// Stop every live module in reverse start order. Returns the ids
    /// stopped, in the order they were stopped.
    pub fn stop_all_plugins(&self) -> Vec<String> {
        let order = self.start_order.lock().clone();
        self.shared.stop_in_order(&order)
    }

    /// Stop everything, close providers, drain the pool and forget all state.
    pub async fn shutdown(&self) {
        let order = self.start_order.lock().clone();
        let shared = self.shared.clone();
        let stopped = match self
            .pool
            .spawn_blocking(move || {
                let stopped = shared.stop_in_order(&order);
                shared.join_orphans();
                stopped
            })
            .await
        {
            Ok(stopped) => stopped,
            Err(e) => {
                tracing::error!(error = %e, "stopping modules failed");
                Vec::new()
            }
        };

        for provider in self.providers.lock().drain(..) {
            if let Err(error) = provider.close() {
                tracing::warn!(provider = provider.name(), %error, "failed to close dependency provider");
            }
        }

        self.pool.shutdown(self.pool_shutdown_timeout).await;

        self.definitions.write().clear();
        *self.graph.write() = None;
        self.start_order.lock().clear();
        self.shared.states.clear();
        self.shared.modules.clear();
        self.shared.workers.lock().clear();
        self.shared.registry.clear();

        tracing::info!(stopped = stopped.len(), "microkernel shut down");
    }
}

impl std::fmt::Debug for Microkernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microkernel")
            .field("modules", &self.definitions.read().len())
            .field("live", &self.shared.modules.len())
            .finish()
    }
}
