//! Context-preserving shims around loaded instances.
//!
//! A shim keeps the instance's originating [`LoadingContext`] alive and makes
//! it the thread's current context for the duration of every delegated call,
//! no matter which thread calls or how long after loading.

use std::path::Path;
use std::sync::Arc;

use dbkernel_core::{
    Connection, ConnectionProperties, Driver, Plugin, PluginResult, RunContext,
};

use crate::context::LoadingContext;

/// Wraps `T` and pins its loading context on every call.
pub struct ContextShim<T: ?Sized> {
    // Dropped before `context`, which may own the library `inner` lives in.
    inner: Box<T>,
    unit: String,
    context: Arc<LoadingContext>,
}

/// A shimmed driver.
pub type DriverShim = ContextShim<dyn Driver>;

/// A shimmed plugin.
pub type PluginShim = ContextShim<dyn Plugin>;

impl<T: ?Sized> ContextShim<T> {
    pub fn new(inner: Box<T>, unit: impl Into<String>, context: Arc<LoadingContext>) -> Self {
        Self {
            inner,
            unit: unit.into(),
            context,
        }
    }

    /// Call `f` on the instance with its context entered.
    pub fn invoke<'a, R>(&'a self, f: impl FnOnce(&'a T) -> R) -> R {
        let _guard = self.context.enter();
        f(&self.inner)
    }

    /// Mutable variant of [`invoke`](Self::invoke).
    pub fn invoke_mut<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.context.enter();
        f(&mut self.inner)
    }

    /// Unit name the instance was created from.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn context(&self) -> &Arc<LoadingContext> {
        &self.context
    }

    pub fn package_path(&self) -> Option<&Path> {
        self.context.package_path()
    }
}

impl<T: ?Sized> std::fmt::Debug for ContextShim<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextShim")
            .field("unit", &self.unit)
            .field("context", &self.context.id())
            .finish()
    }
}

impl Driver for ContextShim<dyn Driver> {
    fn name(&self) -> &str {
        self.invoke(|d| d.name())
    }

    fn accepts_url(&self, url: &str) -> bool {
        self.invoke(|d| d.accepts_url(url))
    }

    fn connect(&self, url: &str, properties: &ConnectionProperties) -> PluginResult<Box<dyn Connection>> {
        let connection = self.invoke(|d| d.connect(url, properties))?;
        // Connections come from the same package and need the same context.
        Ok(Box::new(ContextShim::new(
            connection,
            self.unit.clone(),
            self.context.clone(),
        )))
    }

    fn version(&self) -> (u32, u32) {
        self.invoke(|d| d.version())
    }
}

impl Connection for ContextShim<dyn Connection> {
    fn is_valid(&self) -> bool {
        self.invoke(|c| c.is_valid())
    }

    fn product_name(&self) -> String {
        self.invoke(|c| c.product_name())
    }

    fn close(&mut self) -> PluginResult<()> {
        self.invoke_mut(|c| c.close())
    }
}

impl Plugin for ContextShim<dyn Plugin> {
    fn initialize(&self) -> PluginResult<()> {
        self.invoke(|p| p.initialize())
    }

    fn start(&self, ctx: &RunContext) -> PluginResult<()> {
        self.invoke(|p| p.start(ctx))
    }

    fn stop(&self) -> PluginResult<()> {
        self.invoke(|p| p.stop())
    }
}
