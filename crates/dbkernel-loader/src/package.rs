//! Code packages and the units they declare.
//!
//! A package describes itself with a [`PackageExport`]: the symbols it brings
//! along (its private dependencies) and the units it contains. Units are
//! inspected without running any of their code, so a unit whose dependencies
//! are missing can be rejected before its factory is ever called.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;

use dbkernel_core::{
    Capability, Driver, LoadError, Plugin, PluginError, PluginResult, UnitFailureReason,
    UnitInstance,
};

/// Name of the entry symbol a native package exports.
pub const PACKAGE_ENTRY_SYMBOL: &str = "dbkernel_package_entry";

/// Signature of the native package entry point.
pub type PackageEntryFn = fn() -> PackageExport;

/// Factory producing a fresh unit instance.
pub type UnitFactory = Arc<dyn Fn() -> PluginResult<UnitInstance> + Send + Sync>;

/// A symbol a package exports into its own loading context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedSymbol {
    pub name: String,
    pub version: String,
}

/// A compiled unit inside a package.
#[derive(Clone)]
pub struct UnitDescriptor {
    name: String,
    capabilities: Vec<Capability>,
    is_abstract: bool,
    requires: Vec<String>,
    factory: Option<UnitFactory>,
}

impl UnitDescriptor {
    /// A concrete unit with an explicit capability list and raw factory.
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        factory: impl Fn() -> PluginResult<UnitInstance> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            is_abstract: false,
            requires: Vec::new(),
            factory: Some(Arc::new(factory)),
        }
    }

    /// A concrete driver unit.
    pub fn driver<D, F>(name: impl Into<String>, factory: F) -> Self
    where
        D: Driver + 'static,
        F: Fn() -> PluginResult<D> + Send + Sync + 'static,
    {
        Self::new(name, [Capability::Driver], move || {
            factory().map(|d| UnitInstance::Driver(Box::new(d)))
        })
    }

    /// A concrete plugin unit.
    pub fn plugin<P, F>(name: impl Into<String>, factory: F) -> Self
    where
        P: Plugin + 'static,
        F: Fn() -> PluginResult<P> + Send + Sync + 'static,
    {
        Self::new(name, [Capability::Plugin], move || {
            factory().map(|p| UnitInstance::Plugin(Box::new(p)))
        })
    }

    /// An abstract unit: it declares capabilities but cannot be instantiated.
    pub fn abstract_unit(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            is_abstract: true,
            requires: Vec::new(),
            factory: None,
        }
    }

    /// Declare a symbol that must resolve before this unit can load.
    pub fn requires(mut self, symbol: impl Into<String>) -> Self {
        self.requires.push(symbol.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn implements(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract || self.factory.is_none()
    }

    pub fn required_symbols(&self) -> &[String] {
        &self.requires
    }

    /// Run the unit's factory.
    ///
    /// Factory errors and panics both come back as
    /// [`UnitFailureReason::Instantiation`].
    pub fn instantiate(&self) -> Result<UnitInstance, UnitFailureReason> {
        let Some(factory) = self.factory.as_ref().filter(|_| !self.is_abstract) else {
            return Err(UnitFailureReason::Abstract);
        };

        match catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(e)) => Err(UnitFailureReason::Instantiation {
                message: e.to_string(),
            }),
            Err(payload) => Err(UnitFailureReason::Instantiation {
                message: PluginError::from_panic(payload).to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for UnitDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("is_abstract", &self.is_abstract())
            .field("requires", &self.requires)
            .finish()
    }
}

/// Self-description of a package.
#[derive(Debug, Clone, Default)]
pub struct PackageExport {
    symbols: Vec<ExportedSymbol>,
    units: Vec<UnitDescriptor>,
}

impl PackageExport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a symbol into the package's own context.
    pub fn export(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.symbols.push(ExportedSymbol {
            name: name.into(),
            version: version.into(),
        });
        self
    }

    /// Add a unit.
    pub fn unit(mut self, unit: UnitDescriptor) -> Self {
        self.units.push(unit);
        self
    }

    pub fn units(&self) -> &[UnitDescriptor] {
        &self.units
    }

    pub fn symbols(&self) -> &[ExportedSymbol] {
        &self.symbols
    }

    pub(crate) fn into_parts(self) -> (Vec<ExportedSymbol>, Vec<UnitDescriptor>) {
        (self.symbols, self.units)
    }
}

/// A package opened from disk.
pub struct OpenedPackage {
    pub export: PackageExport,
    /// Native library the units' code lives in, if any. Kept alive by the
    /// loading context for as long as anything it produced is reachable.
    pub library: Option<libloading::Library>,
}

impl OpenedPackage {
    /// A package whose code is linked into the host.
    pub fn linked(export: PackageExport) -> Self {
        Self {
            export,
            library: None,
        }
    }
}

/// Turns a file on disk into a [`PackageExport`].
pub trait PackageOpener: Send + Sync {
    /// Opener name for logs.
    fn name(&self) -> &'static str;

    /// Check whether this opener understands `path`.
    fn handles(&self, path: &Path) -> bool;

    /// Open the package at `path`.
    fn open(&self, path: &Path) -> Result<OpenedPackage, LoadError>;
}

/// Emit the native entry point for a package crate built as a `cdylib`.
///
/// ```ignore
/// dbkernel_loader::declare_package!(|| {
///     PackageExport::new()
///         .export("wire-protocol", "3.1")
///         .unit(UnitDescriptor::driver("acme.Driver", || Ok(AcmeDriver::new())))
/// });
/// ```
#[macro_export]
macro_rules! declare_package {
    ($build:expr) => {
        #[unsafe(no_mangle)]
        pub fn dbkernel_package_entry() -> $crate::PackageExport {
            let build: fn() -> $crate::PackageExport = $build;
            build()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbkernel_core::{Connection, ConnectionProperties, RunContext};

    struct NullDriver;

    impl Driver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }

        fn accepts_url(&self, url: &str) -> bool {
            url.starts_with("null:")
        }

        fn connect(&self, _url: &str, _props: &ConnectionProperties) -> PluginResult<Box<dyn Connection>> {
            Err(PluginError::failed("no connections"))
        }
    }

    struct Idle;

    impl Plugin for Idle {
        fn start(&self, _ctx: &RunContext) -> PluginResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_driver_unit() {
        let unit = UnitDescriptor::driver("null.Driver", || Ok(NullDriver)).requires("protocol");
        assert!(unit.implements(Capability::Driver));
        assert!(!unit.implements(Capability::Plugin));
        assert!(!unit.is_abstract());
        assert_eq!(unit.required_symbols(), ["protocol".to_string()]);

        let instance = unit.instantiate().unwrap();
        assert_eq!(instance.capability(), Capability::Driver);
    }

    #[test]
    fn test_abstract_unit_does_not_instantiate() {
        let unit = UnitDescriptor::abstract_unit("base.Driver", [Capability::Driver]);
        assert!(unit.is_abstract());
        assert_eq!(unit.instantiate().unwrap_err(), UnitFailureReason::Abstract);
    }

    #[test]
    fn test_factory_error_and_panic() {
        let failing = UnitDescriptor::plugin("p.Failing", || -> PluginResult<Idle> {
            Err(PluginError::failed("missing config"))
        });
        match failing.instantiate().unwrap_err() {
            UnitFailureReason::Instantiation { message } => assert!(message.contains("missing config")),
            other => panic!("unexpected {other:?}"),
        }

        let panicking = UnitDescriptor::plugin("p.Panicking", || -> PluginResult<Idle> {
            panic!("boom")
        });
        match panicking.instantiate().unwrap_err() {
            UnitFailureReason::Instantiation { message } => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_export_builder() {
        let export = PackageExport::new()
            .export("protocol", "1.0")
            .unit(UnitDescriptor::plugin("p.Idle", || Ok(Idle)));
        assert_eq!(export.symbols().len(), 1);
        assert_eq!(export.units()[0].name(), "p.Idle");
    }
}
