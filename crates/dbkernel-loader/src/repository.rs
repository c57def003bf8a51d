//! Catalog of downloadable driver packages.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use dbkernel_core::{Event, KernelError, KernelResult};
use serde::{Deserialize, Serialize};

use crate::loader::{DynamicModuleLoader, PackageLoad};

const BUNDLED_REPOSITORY: &str = include_str!("../assets/driver_repository.json");

/// Type alias for boxed futures returned by fetchers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One downloadable driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverEntry {
    /// File name of the package inside the driver directory.
    #[serde(rename = "jarFileName")]
    pub package_file_name: String,
    pub database_name: String,
    pub download_link: String,
    /// Driver unit the package is expected to provide.
    #[serde(rename = "driverClassName")]
    pub driver_unit: String,
}

/// Downloads a URL to a local path.
///
/// Networking lives outside the kernel; hosts plug in whatever client they
/// use.
pub trait FileFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, KernelResult<()>>;
}

/// Fetcher for `file://` URLs and plain paths. Rejects everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFetcher;

impl FileFetcher for LocalFetcher {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, KernelResult<()>> {
        Box::pin(async move {
            let source = match url.strip_prefix("file://") {
                Some(path) => PathBuf::from(path),
                None if !url.contains("://") => PathBuf::from(url),
                None => {
                    return Err(KernelError::Fetch {
                        url: url.to_string(),
                        message: "only file:// URLs are supported".to_string(),
                    });
                }
            };
            tokio::fs::copy(&source, dest)
                .await
                .map_err(|e| KernelError::Fetch {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
            Ok(())
        })
    }
}

/// The `driver_repository.json` catalog.
#[derive(Debug, Clone)]
pub struct DriverRepository {
    path: PathBuf,
    entries: Vec<DriverEntry>,
}

impl DriverRepository {
    /// Entries shipped with the kernel.
    pub fn bundled_entries() -> Vec<DriverEntry> {
        serde_json::from_str(BUNDLED_REPOSITORY).unwrap_or_else(|e| {
            tracing::error!(error = %e, "bundled driver repository is malformed");
            Vec::new()
        })
    }

    /// Read the catalog at `path`, seeding it from the bundled default when
    /// the file does not exist. A malformed file falls back to the bundled
    /// entries without being overwritten.
    pub fn load_or_seed(path: impl Into<PathBuf>) -> KernelResult<Self> {
        let path = path.into();

        if !path.exists() {
            let repo = Self {
                entries: Self::bundled_entries(),
                path,
            };
            repo.save()?;
            tracing::info!(path = %repo.path.display(), "seeded driver repository");
            return Ok(repo);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| KernelError::io(&path, e))?;
        let entries = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed driver repository, using bundled entries");
                Self::bundled_entries()
            }
        };
        Ok(Self { path, entries })
    }

    /// Write the catalog back to disk.
    pub fn save(&self) -> KernelResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| KernelError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&self.entries).map_err(|source| {
            KernelError::Serialization {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, json).map_err(|e| KernelError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[DriverEntry] {
        &self.entries
    }

    /// Find the entry for `database` (case-insensitive).
    pub fn find(&self, database: &str) -> Option<&DriverEntry> {
        self.entries
            .iter()
            .find(|e| e.database_name.eq_ignore_ascii_case(database))
    }

    /// Where `entry`'s package lives inside `driver_dir`.
    pub fn package_path(driver_dir: &Path, entry: &DriverEntry) -> PathBuf {
        driver_dir.join(&entry.package_file_name)
    }

    pub fn is_downloaded(driver_dir: &Path, entry: &DriverEntry) -> bool {
        Self::package_path(driver_dir, entry).is_file()
    }

    /// Staging file a download is written to before it replaces `dest`.
    fn staging_path(dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{name}.part"))
    }

    /// Download the package for `database` into `driver_dir` and load it.
    ///
    /// The package is fetched next to its final path and renamed into place,
    /// so a package that is already loaded is never rewritten while mapped.
    /// Its context is released first and the new file loads into a fresh one.
    ///
    /// Emits `driver_downloaded` once the file is in place; loading then
    /// emits `driver_loaded` as usual.
    pub async fn download(
        &self,
        database: &str,
        driver_dir: &Path,
        fetcher: &dyn FileFetcher,
        loader: &DynamicModuleLoader,
    ) -> KernelResult<PackageLoad> {
        let entry = self
            .find(database)
            .ok_or_else(|| KernelError::config(format!("No driver known for database '{database}'")))?;

        std::fs::create_dir_all(driver_dir).map_err(|e| KernelError::io(driver_dir, e))?;
        let dest = Self::package_path(driver_dir, entry);

        let staging = Self::staging_path(&dest);

        tracing::info!(database = %entry.database_name, url = %entry.download_link, "downloading driver");
        if let Err(error) = fetcher.fetch(&entry.download_link, &staging).await {
            let _ = std::fs::remove_file(&staging);
            return Err(error);
        }

        if loader.release(&dest) {
            tracing::debug!(package = %dest.display(), "released previous driver package");
        }
        if let Err(e) = std::fs::rename(&staging, &dest) {
            let _ = std::fs::remove_file(&staging);
            return Err(KernelError::io(&dest, e));
        }

        loader.events().emit(Event::DriverDownloaded {
            database: entry.database_name.clone(),
            package: dest.clone(),
        });

        let load = loader.load_package(&dest)?;
        if !load.identifiers().contains(&entry.driver_unit) {
            tracing::warn!(
                database = %entry.database_name,
                expected = %entry.driver_unit,
                "downloaded package does not provide the expected driver"
            );
        }
        Ok(load)
    }
}
