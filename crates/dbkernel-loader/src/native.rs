//! Native shared-library packages.

use std::ffi::OsStr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use dbkernel_core::{LoadError, PluginError};
use libloading::{Library, Symbol};

use crate::package::{OpenedPackage, PACKAGE_ENTRY_SYMBOL, PackageEntryFn, PackageOpener};

/// Opens `.so` / `.dylib` / `.dll` packages built with
/// [`declare_package!`](crate::declare_package).
///
/// Each package is loaded as its own library, so its symbol table is separate
/// from every other package's. Packages must be built with the same compiler
/// and `dbkernel-loader` version as the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl NativeOpener {
    pub fn new() -> Self {
        Self
    }

    fn extension_matches(ext: &OsStr) -> bool {
        matches!(ext.to_str(), Some("so" | "dylib" | "dll"))
    }
}

impl PackageOpener for NativeOpener {
    fn name(&self) -> &'static str {
        "native"
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension().is_some_and(Self::extension_matches)
    }

    fn open(&self, path: &Path) -> Result<OpenedPackage, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: loading a library runs its initializers. Packages are trusted
        // code by contract; isolation here is about symbols, not security.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let export = {
            // SAFETY: the entry symbol is emitted by `declare_package!` with
            // exactly the `PackageEntryFn` signature.
            let entry: Symbol<PackageEntryFn> = unsafe { library.get(PACKAGE_ENTRY_SYMBOL.as_bytes()) }
                .map_err(|e| LoadError::Unreadable {
                    path: path.to_path_buf(),
                    message: format!("missing entry symbol `{PACKAGE_ENTRY_SYMBOL}`: {e}"),
                })?;

            catch_unwind(AssertUnwindSafe(|| entry())).map_err(|payload| LoadError::Unreadable {
                path: path.to_path_buf(),
                message: format!(
                    "package entry failed: {}",
                    PluginError::from_panic(payload)
                ),
            })?
        };

        tracing::debug!(
            package = %path.display(),
            units = export.units().len(),
            "opened native package"
        );

        Ok(OpenedPackage {
            export,
            library: Some(library),
        })
    }
}
