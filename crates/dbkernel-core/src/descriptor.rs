//! Plugin descriptors and the manifest catalog.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest format version.
pub const MANIFEST_VERSION: &str = "1.0";

/// Lifecycle status of a catalogued plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginStatus {
    /// Known but not installed.
    #[default]
    Available,
    /// Installed and eligible to start.
    Installed,
    /// Being loaded or started.
    Loading,
    /// Started and running.
    Running,
    /// Loading or running failed.
    Error,
    /// Installed but not started by policy.
    Disabled,
}

impl PluginStatus {
    /// Status a plugin rests in when nothing is running, derived from its flags.
    pub fn resting(installed: bool, enabled: bool) -> Self {
        match (installed, enabled) {
            (false, _) => Self::Available,
            (true, false) => Self::Disabled,
            (true, true) => Self::Installed,
        }
    }

    /// Check if the plugin is active (loading or running).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Loading | Self::Running)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Installed => write!(f, "installed"),
            Self::Loading => write!(f, "loading"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Catalog entry describing one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub category: String,
    /// Name of the unit to instantiate from the package.
    #[serde(default)]
    pub entry_point: String,
    /// Backing code package, absolute or relative to the plugin directory.
    #[serde(default)]
    pub package_path: Option<PathBuf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub installed: bool,
    /// Ids of plugins this one expects to be present.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: PluginStatus,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl PluginDescriptor {
    /// Create a descriptor with the given id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            author: String::new(),
            category: String::new(),
            entry_point: String::new(),
            package_path: None,
            enabled: true,
            installed: false,
            dependencies: Vec::new(),
            status: PluginStatus::Available,
        }
    }

    /// Set the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the entry unit name.
    pub fn with_entry_point(mut self, entry: impl Into<String>) -> Self {
        self.entry_point = entry.into();
        self
    }

    /// Set the backing package.
    pub fn with_package(mut self, path: impl Into<PathBuf>) -> Self {
        self.package_path = Some(path.into());
        self
    }

    /// Add a dependency id.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Whether the descriptor references a package at all.
    pub fn has_package(&self) -> bool {
        self.package_path
            .as_ref()
            .is_some_and(|p| !p.as_os_str().is_empty())
    }

    /// Reset status to what the flags imply.
    pub fn reset_status(&mut self) {
        self.status = PluginStatus::resting(self.installed, self.enabled);
    }
}

/// On-disk catalog of plugins (`plugin-manifest.json`).
///
/// The installed-state snapshot uses the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(default = "default_manifest_version")]
    pub manifest_version: String,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

fn default_manifest_version() -> String {
    MANIFEST_VERSION.to_string()
}

impl PluginManifest {
    /// Create an empty manifest.
    pub fn empty() -> Self {
        Self {
            manifest_version: default_manifest_version(),
            last_updated: Utc::now(),
            plugins: Vec::new(),
        }
    }

    /// Find a plugin by id.
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.id == id)
    }

    /// Find a plugin by id, mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginDescriptor> {
        self.plugins.iter_mut().find(|p| p.id == id)
    }

    /// Insert or replace a descriptor, keeping catalog position on replace.
    pub fn upsert(&mut self, descriptor: PluginDescriptor) {
        match self.get_mut(&descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => self.plugins.push(descriptor),
        }
    }

    /// Reset every status to its resting value.
    ///
    /// Statuses are never trusted across restarts.
    pub fn reset_statuses(&mut self) {
        for plugin in &mut self.plugins {
            plugin.reset_status();
        }
    }

    /// Merge installed/enabled flags from an installed-state snapshot.
    ///
    /// Ids absent from `state` keep their catalog flags.
    pub fn merge_installed_state(&mut self, state: &PluginManifest) {
        for saved in &state.plugins {
            if let Some(plugin) = self.get_mut(&saved.id) {
                plugin.installed = saved.installed;
                plugin.enabled = saved.enabled;
            }
        }
    }

    /// The subset of plugins that are installed.
    pub fn installed_snapshot(&self) -> PluginManifest {
        PluginManifest {
            manifest_version: self.manifest_version.clone(),
            last_updated: Utc::now(),
            plugins: self.plugins.iter().filter(|p| p.installed).cloned().collect(),
        }
    }

    /// Mark the manifest as modified now.
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_enabled_defaults_to_true() {
        let parsed: PluginDescriptor =
            serde_json::from_str(r#"{ "id": "history", "name": "History", "installed": true }"#).unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.enabled, PluginDescriptor::new("history", "History").enabled);
        assert_eq!(PluginStatus::resting(parsed.installed, parsed.enabled), PluginStatus::Installed);

        let disabled: PluginDescriptor =
            serde_json::from_str(r#"{ "id": "history", "name": "History", "enabled": false }"#).unwrap();
        assert!(!disabled.enabled);
    }

    #[test]
    fn test_resting_status() {
        assert_eq!(PluginStatus::resting(false, true), PluginStatus::Available);
        assert_eq!(PluginStatus::resting(true, false), PluginStatus::Disabled);
        assert_eq!(PluginStatus::resting(true, true), PluginStatus::Installed);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&PluginStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
    }

    #[test]
    fn test_descriptor_camel_case_fields() {
        let descriptor = PluginDescriptor::new("export", "Export")
            .with_entry_point("com.example.Export")
            .with_package("export.pkg");
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["entryPoint"], "com.example.Export");
        assert_eq!(json["packagePath"], "export.pkg");
        assert_eq!(json["status"], "AVAILABLE");
    }

    #[test]
    fn test_descriptor_defaults_from_minimal_json() {
        let descriptor: PluginDescriptor =
            serde_json::from_str(r#"{"id": "x", "name": "X"}"#).unwrap();
        assert_eq!(descriptor.version, "0.1.0");
        assert!(!descriptor.installed);
        assert!(!descriptor.has_package());
    }

    #[test]
    fn test_reset_statuses_collapses_running() {
        let mut manifest = PluginManifest::empty();
        let mut running = PluginDescriptor::new("a", "A");
        running.installed = true;
        running.status = PluginStatus::Running;
        manifest.upsert(running);

        manifest.reset_statuses();
        assert_eq!(manifest.get("a").unwrap().status, PluginStatus::Installed);
    }

    #[test]
    fn test_merge_installed_state() {
        let mut manifest = PluginManifest::empty();
        manifest.upsert(PluginDescriptor::new("a", "A"));
        manifest.upsert(PluginDescriptor::new("b", "B"));

        let mut state = PluginManifest::empty();
        let mut a = PluginDescriptor::new("a", "A");
        a.installed = true;
        a.enabled = false;
        state.upsert(a);
        state.upsert(PluginDescriptor::new("ghost", "Ghost"));

        manifest.merge_installed_state(&state);
        let a = manifest.get("a").unwrap();
        assert!(a.installed);
        assert!(!a.enabled);
        assert!(!manifest.get("b").unwrap().installed);
        assert!(manifest.get("ghost").is_none());
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut manifest = PluginManifest::empty();
        manifest.upsert(PluginDescriptor::new("a", "A"));
        manifest.upsert(PluginDescriptor::new("b", "B"));
        manifest.upsert(PluginDescriptor::new("a", "A2"));

        assert_eq!(manifest.plugins[0].name, "A2");
        assert_eq!(manifest.plugins.len(), 2);
    }
}
