//! Host configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Symbol exported by the host to every loading context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostExport {
    /// Symbol or library name.
    pub name: String,
    /// Version the host provides.
    pub version: String,
}

impl HostExport {
    /// Create a new host export.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Configuration for the plugin and driver subsystem.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct HostConfig {
    /// Directory holding plugin packages and the plugin manifests.
    #[builder(default = "PathBuf::from(\"plugins\")")]
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Directory holding driver packages and the driver repository.
    #[builder(default = "PathBuf::from(\"drivers\")")]
    #[serde(default = "default_driver_dir")]
    pub driver_dir: PathBuf,

    /// Catalog of all known plugins.
    #[builder(default = "\"plugin-manifest.json\".to_string()")]
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// Snapshot of installed/enabled flags.
    #[builder(default = "\"installed-plugins.json\".to_string()")]
    #[serde(default = "default_installed_file")]
    pub installed_file: String,

    /// Catalog of downloadable drivers.
    #[builder(default = "\"driver_repository.json\".to_string()")]
    #[serde(default = "default_repository_file")]
    pub repository_file: String,

    /// How long `start*` waits for a plugin's start sequence.
    #[builder(default = "10_000")]
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// How long a stop waits for a plugin's worker before detaching it.
    #[builder(default = "3_000")]
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// How long shutdown waits for pool tasks before aborting them.
    #[builder(default = "5_000")]
    #[serde(default = "default_pool_shutdown_timeout_ms")]
    pub pool_shutdown_timeout_ms: u64,

    /// Symbols the host makes visible to every package.
    #[builder(default = "default_host_exports()")]
    #[serde(default = "default_host_exports")]
    pub host_exports: Vec<HostExport>,
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_driver_dir() -> PathBuf {
    PathBuf::from("drivers")
}

fn default_manifest_file() -> String {
    "plugin-manifest.json".to_string()
}

fn default_installed_file() -> String {
    "installed-plugins.json".to_string()
}

fn default_repository_file() -> String {
    "driver_repository.json".to_string()
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    3_000
}

fn default_pool_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_host_exports() -> Vec<HostExport> {
    vec![HostExport::new("dbkernel-core", env!("CARGO_PKG_VERSION"))]
}

impl HostConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref dir) = self.plugin_dir {
            if dir.as_os_str().is_empty() {
                return Err("Plugin directory cannot be empty".to_string());
            }
        }
        if let Some(ref dir) = self.driver_dir {
            if dir.as_os_str().is_empty() {
                return Err("Driver directory cannot be empty".to_string());
            }
        }
        if self.stop_timeout_ms == Some(0) {
            return Err("Stop timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl HostConfig {
    /// Create a new host config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Create a config rooted at `base`, with `plugins/` and `drivers/` below it.
    pub fn rooted_at(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            plugin_dir: base.join("plugins"),
            driver_dir: base.join("drivers"),
            ..Self::default()
        }
    }

    /// Path of the plugin manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.manifest_file)
    }

    /// Path of the installed-state snapshot.
    pub fn installed_path(&self) -> PathBuf {
        self.plugin_dir.join(&self.installed_file)
    }

    /// Path of the driver repository catalog.
    pub fn repository_path(&self) -> PathBuf {
        self.driver_dir.join(&self.repository_file)
    }

    /// Resolve a package reference against the plugin directory.
    pub fn resolve_plugin_package(&self, package: impl AsRef<Path>) -> PathBuf {
        let package = package.as_ref();
        if package.is_absolute() {
            package.to_path_buf()
        } else {
            self.plugin_dir.join(package)
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn pool_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_shutdown_timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            driver_dir: default_driver_dir(),
            manifest_file: default_manifest_file(),
            installed_file: default_installed_file(),
            repository_file: default_repository_file(),
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            pool_shutdown_timeout_ms: default_pool_shutdown_timeout_ms(),
            host_exports: default_host_exports(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = HostConfig::builder()
            .plugin_dir("/opt/app/plugins")
            .stop_timeout_ms(500u64)
            .build()
            .unwrap();

        assert_eq!(config.plugin_dir, PathBuf::from("/opt/app/plugins"));
        assert_eq!(config.driver_dir, PathBuf::from("drivers"));
        assert_eq!(config.stop_timeout(), Duration::from_millis(500));
        assert_eq!(config.manifest_path(), PathBuf::from("/opt/app/plugins/plugin-manifest.json"));
    }

    #[test]
    fn test_builder_rejects_zero_stop_timeout() {
        let result = HostConfig::builder().stop_timeout_ms(0u64).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rooted_at() {
        let config = HostConfig::rooted_at("/data");
        assert_eq!(config.installed_path(), PathBuf::from("/data/plugins/installed-plugins.json"));
        assert_eq!(config.repository_path(), PathBuf::from("/data/drivers/driver_repository.json"));
    }

    #[test]
    fn test_resolve_plugin_package() {
        let config = HostConfig::rooted_at("/data");
        assert_eq!(
            config.resolve_plugin_package("export.pkg"),
            PathBuf::from("/data/plugins/export.pkg")
        );
        assert_eq!(
            config.resolve_plugin_package("/elsewhere/export.pkg"),
            PathBuf::from("/elsewhere/export.pkg")
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let config: HostConfig = serde_json::from_str(r#"{"stop_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.stop_timeout_ms, 250);
        assert_eq!(config.plugin_dir, PathBuf::from("plugins"));
        assert!(!config.host_exports.is_empty());
    }
}
