//! Error types shared by the kernel crates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors that can cross the kernel boundary.
///
/// Most failures inside the kernel are recovered locally (defaults, skipped
/// units, `ERROR` status). Only these reach a caller.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Missing or malformed manifest, descriptor or config.
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Backing code package is missing on disk.
    #[error("Package not found: {path}")]
    PackageNotFound { path: PathBuf },

    /// A package or unit could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A plugin's lifecycle method failed.
    #[error("Plugin '{id}' lifecycle error: {source}")]
    Lifecycle {
        id: String,
        #[source]
        source: PluginError,
    },

    /// I/O failure during persistence.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure during persistence.
    #[error("Serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The external file fetcher could not download a package.
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
}

impl KernelError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::PackageNotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Errors raised while opening a package or resolving one of its units.
///
/// Per-unit problems during a package scan are not raised with this type;
/// they are collected as [`UnitFailure`]s instead.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Package path does not exist.
    #[error("Package not found: {path}")]
    NotFound { path: PathBuf },

    /// Package exists but could not be read or mapped.
    #[error("Package unreadable: {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    /// No opener handles this kind of package.
    #[error("Unsupported package type: {path}")]
    Unsupported { path: PathBuf },

    /// The package's loading context has been released.
    #[error("Loading context for {path} is closed")]
    ContextClosed { path: PathBuf },

    /// A named unit does not exist in the package.
    #[error("Unit '{unit}' not found in {path}")]
    UnitNotFound { path: PathBuf, unit: String },

    /// A named unit exists but could not be turned into an instance.
    #[error("Unit '{unit}' failed to load: {reason}")]
    Unit { unit: String, reason: UnitFailureReason },

    /// Directory scan failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Why a single unit inside a package was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitFailureReason {
    /// A symbol the unit links against does not resolve in its context.
    UnresolvedSymbol { symbol: String },
    /// The unit does not provide the requested capability.
    MissingCapability { capability: String },
    /// The unit is abstract and cannot be instantiated.
    Abstract,
    /// The unit's factory returned an error or panicked.
    Instantiation { message: String },
}

impl std::fmt::Display for UnitFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedSymbol { symbol } => write!(f, "unresolved symbol '{symbol}'"),
            Self::MissingCapability { capability } => {
                write!(f, "does not provide capability '{capability}'")
            }
            Self::Abstract => write!(f, "abstract unit"),
            Self::Instantiation { message } => write!(f, "instantiation failed: {message}"),
        }
    }
}

/// A unit that was skipped during a package scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Package the unit belongs to.
    pub package: PathBuf,
    /// Unit name.
    pub unit: String,
    /// Why it was skipped.
    pub reason: UnitFailureReason,
}

impl UnitFailure {
    /// Create a new unit failure.
    pub fn new(package: impl Into<PathBuf>, unit: impl Into<String>, reason: UnitFailureReason) -> Self {
        Self {
            package: package.into(),
            unit: unit.into(),
            reason,
        }
    }
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in {}: {}", self.unit, self.package.display(), self.reason)
    }
}

/// Errors raised by plugin and driver code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    /// The plugin reported a failure.
    #[error("{message}")]
    Failed { message: String },

    /// The plugin panicked.
    #[error("panicked: {message}")]
    Panicked { message: String },

    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// The operation did not finish within its time budget.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl PluginError {
    /// Create a plain failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked { message }
    }
}

/// Result type for plugin and driver code.
pub type PluginResult<T> = Result<T, PluginError>;
