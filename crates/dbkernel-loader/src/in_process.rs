//! Packages whose code is linked into the host.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dbkernel_core::LoadError;

use crate::package::{OpenedPackage, PackageExport, PackageOpener};

type PackageBuilder = Arc<dyn Fn() -> PackageExport + Send + Sync>;

/// Serves `.pkg` packages from builders registered by file name.
///
/// The file on disk only marks the package as installed; its units come from
/// the registered builder. Contexts, shims and failure handling are the same
/// as for native packages, which makes this the opener for built-in drivers
/// and for tests.
#[derive(Default, Clone)]
pub struct InProcessOpener {
    builders: Arc<DashMap<String, PackageBuilder>>,
}

impl InProcessOpener {
    /// File extension this opener claims.
    pub const EXTENSION: &'static str = "pkg";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register the builder for packages named `file_name`.
    pub fn register(
        &self,
        file_name: impl Into<String>,
        build: impl Fn() -> PackageExport + Send + Sync + 'static,
    ) {
        self.builders.insert(file_name.into(), Arc::new(build));
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with_package(
        self,
        file_name: impl Into<String>,
        build: impl Fn() -> PackageExport + Send + Sync + 'static,
    ) -> Self {
        self.register(file_name, build);
        self
    }

    /// Names of all registered packages.
    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl PackageOpener for InProcessOpener {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension().is_some_and(|e| e == Self::EXTENSION)
    }

    fn open(&self, path: &Path) -> Result<OpenedPackage, LoadError> {
        if !path.is_file() {
            return Err(LoadError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoadError::Unsupported {
                path: path.to_path_buf(),
            })?;

        // Clone out of the map so the builder never runs under a shard lock.
        let build = self
            .builders
            .get(file_name)
            .map(|b| b.value().clone())
            .ok_or_else(|| LoadError::Unreadable {
                path: path.to_path_buf(),
                message: format!("no in-process package registered as '{file_name}'"),
            })?;

        Ok(OpenedPackage::linked(build()))
    }
}

impl std::fmt::Debug for InProcessOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessOpener")
            .field("packages", &self.package_names())
            .finish()
    }
}
