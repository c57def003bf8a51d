//! Dynamic package loading for dbkernel.
//!
//! This crate loads code packages from disk, each into its own isolated
//! [`LoadingContext`], and turns the units inside them into live drivers and
//! plugins.
//!
//! # Overview
//!
//! - **Isolated contexts**: a package's symbols resolve parent-first through
//!   the host, so host exports are shared and private dependencies are not
//! - **Shims**: every loaded instance is wrapped in a [`ContextShim`] that
//!   re-enters its context on each call, from any thread
//! - **Lenient scans**: units that cannot load are collected as
//!   [`UnitFailure`](dbkernel_core::UnitFailure)s, never abort a package
//! - **Async loading** on a [`WorkerPool`] with per-package progress
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use dbkernel_loader::{DriverRegistry, DynamicModuleLoader};
//!
//! let drivers = Arc::new(DriverRegistry::new());
//! let loader = DynamicModuleLoader::new(&[], drivers.clone());
//!
//! let result = loader.load_all_packages(Path::new("drivers")).unwrap();
//! println!("{}", result.message);
//!
//! if let Some(driver) = drivers.driver_for_url("jdbc:postgresql://localhost/app") {
//!     println!("using {}", driver.unit());
//! }
//! ```

mod context;
mod drivers;
mod in_process;
mod loader;
mod native;
mod package;
mod pool;
mod progress;
mod repository;
mod shim;

pub use context::{ContextGuard, ContextId, LoadingContext, ResolvedSymbol};
pub use drivers::{DriverKey, DriverRegistry};
pub use in_process::InProcessOpener;
pub use loader::{DynamicModuleLoader, LoadedInstance, LoadedModuleHandle, PackageLoad};
pub use native::NativeOpener;
pub use package::{
    ExportedSymbol, OpenedPackage, PACKAGE_ENTRY_SYMBOL, PackageEntryFn, PackageExport,
    PackageOpener, UnitDescriptor, UnitFactory,
};
pub use pool::{PoolShutdown, WorkerPool};
pub use progress::{
    Callback, CallbackExecutor, CallbackQueue, DriverLoadResult, InlineExecutor, LoadProgress,
    QueuedExecutor,
};
pub use repository::{BoxFuture, DriverEntry, DriverRepository, FileFetcher, LocalFetcher};
pub use shim::{ContextShim, DriverShim, PluginShim};
