//! Plugin lifecycle for dbkernel.
//!
//! Two hosts live here:
//!
//! - [`Microkernel`] builds modules in dependency order, injecting what each
//!   one declares from the shared [`ModuleRegistry`](dbkernel_core::ModuleRegistry),
//!   starts them concurrently and stops them in reverse order.
//! - [`PluginManager`] owns the operator-facing catalog: install, enable,
//!   load from a package, start and stop, with the installed state persisted
//!   across restarts.
//!
//! Both run every plugin's `start` on its own [`PluginWorker`] thread, so a
//! plugin that blocks until it is cancelled never holds up the others.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dbkernel_core::{EventBus, HostConfig, ModuleRegistry};
//! use dbkernel_loader::{DriverRegistry, DynamicModuleLoader, WorkerPool};
//! use dbkernel_plugin::PluginManager;
//!
//! # async fn run() {
//! let config = HostConfig::rooted_at("data");
//! let events = Arc::new(EventBus::new());
//! let loader = Arc::new(
//!     DynamicModuleLoader::new(&config.host_exports, Arc::new(DriverRegistry::new()))
//!         .with_events(events.clone()),
//! );
//! let manager = PluginManager::new(
//!     config,
//!     loader,
//!     Arc::new(ModuleRegistry::new()),
//!     WorkerPool::current(),
//!     events,
//! );
//!
//! manager.load_manifest();
//! manager.start_all_enabled_plugins().await;
//! manager.shutdown().await;
//! # }
//! ```

mod graph;
mod kernel;
mod manager;
mod manifest;
mod module;
mod worker;

pub use graph::{DependencyGraph, TopologicalOrder};
pub use kernel::{Microkernel, ModuleState, StartReport};
pub use manager::PluginManager;
pub use manifest::{ManifestSource, ManifestStore};
pub use module::{
    DependencyProvider, DependencySet, Module, ModuleDefinition, ModuleInstance, ProvidedFactory,
};
pub use worker::PluginWorker;
