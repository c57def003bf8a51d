//! Manifest and installed-state persistence.

use std::path::{Path, PathBuf};

use dbkernel_core::{HostConfig, KernelError, KernelResult, PluginManifest};
use serde::Serialize;
use serde::de::DeserializeOwned;

const BUNDLED_MANIFEST: &str = include_str!("../assets/default-manifest.json");

/// Where a loaded manifest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestSource {
    Disk,
    /// The bundled default, seeded to disk.
    Bundled,
    Empty,
}

/// Reads and writes `plugin-manifest.json` and `installed-plugins.json`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    manifest_path: PathBuf,
    installed_path: PathBuf,
}

impl ManifestStore {
    pub fn new(manifest_path: impl Into<PathBuf>, installed_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            installed_path: installed_path.into(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.manifest_path(), config.installed_path())
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn installed_path(&self) -> &Path {
        &self.installed_path
    }

    /// The manifest shipped with the kernel.
    pub fn bundled() -> Option<PluginManifest> {
        match serde_json::from_str(BUNDLED_MANIFEST) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::error!(error = %e, "bundled plugin manifest is malformed");
                None
            }
        }
    }

    /// Load the catalog: from disk, else the bundled default (seeded to
    /// disk), else empty. Never fails.
    ///
    /// Installed/enabled flags from the installed-state snapshot are merged
    /// in and every status is reset to its resting value.
    pub fn load(&self) -> (PluginManifest, ManifestSource) {
        let (mut manifest, source) = match read_json::<PluginManifest>(&self.manifest_path) {
            Ok(Some(manifest)) => (manifest, ManifestSource::Disk),
            Ok(None) => self.seed(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read plugin manifest, using bundled default");
                match Self::bundled() {
                    Some(manifest) => (manifest, ManifestSource::Bundled),
                    None => (PluginManifest::empty(), ManifestSource::Empty),
                }
            }
        };

        match read_json::<PluginManifest>(&self.installed_path) {
            Ok(Some(state)) => manifest.merge_installed_state(&state),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable installed-state snapshot"),
        }
        manifest.reset_statuses();

        tracing::debug!(plugins = manifest.plugins.len(), ?source, "loaded plugin manifest");
        (manifest, source)
    }

    fn seed(&self) -> (PluginManifest, ManifestSource) {
        let Some(manifest) = Self::bundled() else {
            return (PluginManifest::empty(), ManifestSource::Empty);
        };
        if let Err(e) = write_json(&self.manifest_path, &manifest) {
            tracing::warn!(error = %e, "failed to seed plugin manifest");
        } else {
            tracing::info!(path = %self.manifest_path.display(), "seeded plugin manifest");
        }
        (manifest, ManifestSource::Bundled)
    }

    pub fn save_manifest(&self, manifest: &PluginManifest) -> KernelResult<()> {
        write_json(&self.manifest_path, manifest)
    }

    pub fn save_installed_state(&self, manifest: &PluginManifest) -> KernelResult<()> {
        write_json(&self.installed_path, &manifest.installed_snapshot())
    }
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> KernelResult<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KernelError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| KernelError::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> KernelResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| KernelError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| KernelError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|e| KernelError::io(path, e))
}
