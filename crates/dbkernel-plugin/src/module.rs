//! Module definitions, dependency sets and dependency providers.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dbkernel_core::{Instance, ModuleRegistry, Plugin, PluginError, PluginResult};

/// A module managed by the [`Microkernel`](crate::Microkernel).
pub trait Module: Send + Sync + 'static {
    /// Startup hooks to run, in order, right after the module is registered.
    fn startup_hooks(&self) -> &[&'static str] {
        &[]
    }

    /// Run one startup hook.
    fn invoke_startup(&self, hook: &str) -> PluginResult<()> {
        Err(PluginError::failed(format!("unknown startup hook '{hook}'")))
    }

    /// The generic lifecycle, if this module has one.
    fn as_plugin(&self) -> Option<&dyn Plugin> {
        None
    }
}

/// A freshly constructed module, viewable both as a [`Module`] and as the
/// concrete type other modules get injected.
#[derive(Clone)]
pub struct ModuleInstance {
    module: Arc<dyn Module>,
    instance: Instance,
}

impl ModuleInstance {
    pub fn new<T: Module>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Module>(value: Arc<T>) -> Self {
        Self {
            module: value.clone(),
            instance: value,
        }
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

/// Dependencies handed to a module factory.
///
/// Every declared key is present; keys missing from the registry map to
/// `None` instead of failing construction.
#[derive(Clone, Default)]
pub struct DependencySet {
    entries: BTreeMap<String, Option<Instance>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `keys` in `registry`.
    pub fn resolve<'a>(registry: &ModuleRegistry, keys: impl IntoIterator<Item = &'a String>) -> Self {
        Self {
            entries: keys
                .into_iter()
                .map(|k| (k.clone(), registry.get(k)))
                .collect(),
        }
    }

    /// Add an entry by hand.
    pub fn with(mut self, key: impl Into<String>, instance: Option<Instance>) -> Self {
        self.entries.insert(key.into(), instance);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Instance> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    /// Typed lookup. `None` when missing or of another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).cloned().and_then(|i| i.downcast::<T>().ok())
    }

    /// Declared keys that resolved to nothing.
    pub fn missing(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DependencySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.is_some())))
            .finish()
    }
}

type ModuleFactory = Arc<dyn Fn(&DependencySet) -> PluginResult<ModuleInstance> + Send + Sync>;

/// How to build one module: its id, the keys it needs and a factory.
#[derive(Clone)]
pub struct ModuleDefinition {
    id: String,
    dependencies: Vec<String>,
    factory: ModuleFactory,
}

impl ModuleDefinition {
    pub fn new(
        id: impl Into<String>,
        factory: impl Fn(&DependencySet) -> PluginResult<ModuleInstance> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Declare a dependency on the instance registered under `key`.
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.dependencies.contains(&key) {
            self.dependencies.push(key);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Run the factory. Panics become [`PluginError::Panicked`].
    pub fn instantiate(&self, deps: &DependencySet) -> PluginResult<ModuleInstance> {
        catch_unwind(AssertUnwindSafe(|| (self.factory)(deps)))
            .unwrap_or_else(|payload| Err(PluginError::from_panic(payload)))
    }
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// A named instance produced by a [`DependencyProvider`].
pub struct ProvidedFactory {
    key: String,
    make: Box<dyn FnOnce() -> PluginResult<Instance> + Send>,
}

impl ProvidedFactory {
    pub fn new(key: impl Into<String>, make: impl FnOnce() -> PluginResult<Instance> + Send + 'static) -> Self {
        Self {
            key: key.into(),
            make: Box::new(make),
        }
    }

    /// Provide an already-built value.
    pub fn value<T: Any + Send + Sync>(key: impl Into<String>, value: T) -> Self {
        Self::new(key, move || Ok(Arc::new(value) as Instance))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn build(self) -> (String, PluginResult<Instance>) {
        let make = self.make;
        let result =
            catch_unwind(AssertUnwindSafe(make)).unwrap_or_else(|p| Err(PluginError::from_panic(p)));
        (self.key, result)
    }
}

/// Produces named instances that modules can depend on.
///
/// Providers run before any module is instantiated.
pub trait DependencyProvider: Send + Sync {
    fn name(&self) -> &str;

    fn factories(&self) -> Vec<ProvidedFactory>;

    /// Release whatever the provider holds. Called once during shutdown.
    fn close(&self) -> PluginResult<()> {
        Ok(())
    }
}
