//! Lifecycle events emitted to the host's notification layer.
//!
//! The kernel only emits; who listens is up to the host. Consumers subscribe
//! by event kind string (see [`Event::kind`]).

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Events emitted by the plugin manager and the driver loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // ==================== Plugin Events ====================
    /// A plugin was marked installed.
    PluginInstalled { id: String },

    /// A plugin was uninstalled.
    PluginUninstalled { id: String },

    /// A plugin's entry unit was instantiated and initialized.
    PluginLoaded { id: String },

    /// A plugin's start sequence completed.
    PluginStarted { id: String },

    /// A plugin was stopped.
    PluginStopped { id: String },

    /// Loading, starting or stopping a plugin failed.
    PluginError { id: String, message: String },

    // ==================== Driver Events ====================
    /// A driver package was fetched into the driver directory.
    DriverDownloaded { database: String, package: PathBuf },

    /// Drivers were registered from a package.
    DriverLoaded { package: PathBuf, drivers: Vec<String> },
}

impl Event {
    /// Kind string consumers subscribe to.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PluginInstalled { .. } => "plugin_installed",
            Self::PluginUninstalled { .. } => "plugin_uninstalled",
            Self::PluginLoaded { .. } => "plugin_loaded",
            Self::PluginStarted { .. } => "plugin_started",
            Self::PluginStopped { .. } => "plugin_stopped",
            Self::PluginError { .. } => "plugin_error",
            Self::DriverDownloaded { .. } => "driver_downloaded",
            Self::DriverLoaded { .. } => "driver_loaded",
        }
    }

    /// Check if this is a plugin lifecycle event.
    pub fn is_plugin_event(&self) -> bool {
        !matches!(self, Self::DriverDownloaded { .. } | Self::DriverLoaded { .. })
    }
}

/// Fire-and-forget receiver of kernel events.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block for long.
    fn emit(&self, event: Event);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Subscribe-by-kind event fan-out.
///
/// Listeners registered under `"*"` receive every event.
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<String, Vec<Listener>>,
}

impl EventBus {
    /// Wildcard kind matching every event.
    pub const ALL: &'static str = "*";

    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of `kind`.
    pub fn subscribe(&self, kind: impl Into<String>, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners
            .entry(kind.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Number of listeners for `kind` (wildcards excluded).
    pub fn listener_count(&self, kind: &str) -> usize {
        self.listeners.get(kind).map_or(0, |l| l.len())
    }

    fn listeners_for(&self, kind: &str) -> Vec<Listener> {
        let mut out = Vec::new();
        if let Some(l) = self.listeners.get(kind) {
            out.extend(l.iter().cloned());
        }
        if let Some(l) = self.listeners.get(Self::ALL) {
            out.extend(l.iter().cloned());
        }
        out
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        // Listeners are cloned out first so none runs under a map shard lock.
        for listener in self.listeners_for(event.kind()) {
            listener(&event);
        }
    }
}
