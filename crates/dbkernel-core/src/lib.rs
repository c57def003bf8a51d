//! Core types and traits for dbkernel.
//!
//! This crate provides the pieces every other dbkernel crate builds on: the
//! concurrent [`ModuleRegistry`], the capability traits loaded code implements
//! ([`Driver`], [`Plugin`]), plugin descriptors and the manifest catalog,
//! lifecycle events and host configuration.

mod capability;
mod config;
mod descriptor;
mod error;
mod events;
mod registry;

pub use capability::{
    Capability, Connection, ConnectionProperties, Driver, Plugin, RunContext, UnitInstance,
};
pub use config::{HostConfig, HostConfigBuilder, HostExport};
pub use descriptor::{MANIFEST_VERSION, PluginDescriptor, PluginManifest, PluginStatus};
pub use error::{
    KernelError, KernelResult, LoadError, PluginError, PluginResult, UnitFailure,
    UnitFailureReason,
};
pub use events::{Event, EventBus, EventSink, NullSink};
pub use registry::{Instance, ModuleRecord, ModuleRegistry};
