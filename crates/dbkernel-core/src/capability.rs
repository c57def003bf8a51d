//! Capabilities a dynamically loaded unit can provide.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PluginResult;

/// Contract a loaded unit may satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// A database driver.
    Driver,
    /// A lifecycle-managed plugin.
    Plugin,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Plugin => write!(f, "plugin"),
        }
    }
}

/// Connection properties passed to [`Driver::connect`].
pub type ConnectionProperties = BTreeMap<String, String>;

/// An open database connection produced by a driver.
pub trait Connection: Send {
    /// Check whether the connection is still usable.
    fn is_valid(&self) -> bool;

    /// Name of the product on the other end (e.g. "PostgreSQL").
    fn product_name(&self) -> String;

    /// Close the connection.
    fn close(&mut self) -> PluginResult<()>;
}

/// A database driver capability.
pub trait Driver: Send + Sync {
    /// Fully qualified driver name (e.g. "org.postgresql.Driver").
    fn name(&self) -> &str;

    /// Check whether this driver handles `url`.
    fn accepts_url(&self, url: &str) -> bool;

    /// Open a connection to `url`.
    fn connect(&self, url: &str, properties: &ConnectionProperties) -> PluginResult<Box<dyn Connection>>;

    /// Driver version as `(major, minor)`.
    fn version(&self) -> (u32, u32) {
        (1, 0)
    }
}

/// Context handed to a plugin while it runs.
///
/// The cancellation token is signalled when the host wants the plugin to
/// stop; long-running `start` implementations must watch it.
#[derive(Debug, Clone)]
pub struct RunContext {
    id: String,
    cancel: CancellationToken,
}

impl RunContext {
    /// Create a run context for plugin `id`.
    pub fn new(id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            cancel,
        }
    }

    /// Id of the running plugin.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token signalled on stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// The generic plugin lifecycle capability.
///
/// Methods take `&self` because a plugin is shared between the registry, the
/// manager and its dedicated worker; implementations keep their own state
/// behind interior mutability.
pub trait Plugin: Send + Sync {
    /// Prepare resources. Called once, before the first `start`.
    fn initialize(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Start the plugin. Runs on the plugin's dedicated worker and may block
    /// until `ctx` is cancelled.
    fn start(&self, ctx: &RunContext) -> PluginResult<()>;

    /// Stop the plugin.
    fn stop(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// What a unit's factory produces.
pub enum UnitInstance {
    Driver(Box<dyn Driver>),
    Plugin(Box<dyn Plugin>),
}

impl UnitInstance {
    /// Capability this instance actually provides.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Driver(_) => Capability::Driver,
            Self::Plugin(_) => Capability::Plugin,
        }
    }
}

impl std::fmt::Debug for UnitInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver(d) => f.debug_tuple("Driver").field(&d.name()).finish(),
            Self::Plugin(_) => f.debug_tuple("Plugin").finish(),
        }
    }
}
