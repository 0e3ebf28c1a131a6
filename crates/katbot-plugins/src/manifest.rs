//! Plugin manifest types.
//!
//! A plugin manifest (`plugin.toml`, or `plugin.json` as a fallback) describes
//! a plugin's identity, entry point, dependencies and requested permissions.
//! Manifests are read from disk during discovery and checked by the
//! [`ManifestValidator`](crate::validate::ManifestValidator) before loading.
//!
//! Required fields deserialize with empty defaults so that a missing `name`
//! or `author` surfaces as a validation error rather than a parse error.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// Primary manifest file name.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// Fallback manifest file name.
pub const MANIFEST_JSON_FILE_NAME: &str = "plugin.json";

/// A plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier. Checked by the validator, not on parse.
    #[serde(default)]
    pub id: String,
    /// Human-readable display name.
    #[serde(default)]
    pub name: String,
    /// Semantic version string.
    #[serde(default)]
    pub version: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author or maintainer.
    #[serde(default)]
    pub author: String,
    /// Entry point, relative to the plugin directory.
    #[serde(default)]
    pub main: String,
    /// Plugins this one needs loaded first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    /// Plugins this one cooperates with when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peer_dependencies: Vec<Dependency>,
    /// Requested permissions, e.g. `network:api.example.com` or `filesystem:data`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Oldest supported host version, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    /// Newest supported host version, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<String>,
    /// Operations the plugin serves. Becomes the default sandbox allowlist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Free-form search tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Marketplace-style category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Search keywords.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Default configuration, deep-merged with per-plugin overrides.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A dependency on another plugin.
///
/// ```toml
/// [[dependencies]]
/// name = "storage"
/// version = "^1.0.0"
/// optional = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Id of the plugin depended upon.
    pub name: String,
    /// Version constraint; empty means any version.
    #[serde(default)]
    pub version: String,
    /// Optional dependencies never block resolution or unregistration.
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// A required dependency.
    pub fn required(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// An optional dependency.
    pub fn optional(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: true,
        }
    }
}

/// A parsed permission string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    /// `network` or `network:<domain>`.
    Network(Option<String>),
    /// `filesystem` or `filesystem:<path>`.
    Filesystem(Option<String>),
}

impl Permission {
    /// Parse `kind[:scope]`. Returns `None` for unknown kinds.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, scope) = match s.split_once(':') {
            Some((kind, scope)) if !scope.is_empty() => (kind, Some(scope.to_string())),
            Some((kind, _)) => (kind, None),
            None => (s, None),
        };
        match kind {
            "network" => Some(Self::Network(scope)),
            "filesystem" => Some(Self::Filesystem(scope)),
            _ => None,
        }
    }
}

impl PluginManifest {
    /// Minimal manifest with the required fields filled in.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        author: impl Into<String>,
        main: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            author: author.into(),
            main: main.into(),
            dependencies: Vec::new(),
            peer_dependencies: Vec::new(),
            permissions: Vec::new(),
            min_host_version: None,
            max_host_version: None,
            commands: Vec::new(),
            tags: Vec::new(),
            category: None,
            keywords: Vec::new(),
            config: serde_json::Map::new(),
        }
    }

    /// The validated plugin id.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if `id` is malformed.
    pub fn plugin_id(&self) -> PluginResult<PluginId> {
        PluginId::new(self.id.clone())
    }

    /// Parse manifest text, choosing TOML or JSON by the file extension.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParseError`] if the content is malformed.
    pub fn parse(path: &Path, content: &str) -> PluginResult<Self> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(content).map_err(|e| e.to_string())
        } else {
            toml::from_str(content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| PluginError::ManifestParseError {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Every permission that parses, skipping unknown ones.
    pub fn parsed_permissions(&self) -> impl Iterator<Item = Permission> + '_ {
        self.permissions.iter().filter_map(|p| Permission::parse(p))
    }

    /// Required plus optional dependency names, in declaration order.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_full_manifest_toml() {
        let toml_str = r#"
            id = "weather"
            name = "Weather"
            version = "1.2.0"
            description = "Forecasts on demand"
            author = "Katbot Team"
            main = "weather.toml"
            permissions = ["network:api.weather.example"]
            min_host_version = "0.1.0"
            commands = ["forecast"]
            tags = ["utility", "weather"]
            category = "utilities"

            [[dependencies]]
            name = "http"
            version = "^1.0.0"

            [[peer_dependencies]]
            name = "geo"
            version = "~2.1.0"

            [config]
            units = "metric"
            cache = { ttl = 60 }
        "#;
        let manifest = PluginManifest::parse(&PathBuf::from("plugin.toml"), toml_str).unwrap();
        assert_eq!(manifest.id, "weather");
        assert_eq!(manifest.dependencies, vec![Dependency::required("http", "^1.0.0")]);
        assert_eq!(manifest.peer_dependencies[0].name, "geo");
        assert_eq!(manifest.commands, vec!["forecast".to_string()]);
        assert_eq!(manifest.config["cache"]["ttl"], serde_json::json!(60));
        assert_eq!(manifest.plugin_id().unwrap().as_str(), "weather");
    }

    #[test]
    fn test_missing_required_fields_still_parse() {
        let manifest =
            PluginManifest::parse(&PathBuf::from("plugin.toml"), "id = \"bare\"").unwrap();
        assert!(manifest.name.is_empty());
        assert!(manifest.author.is_empty());
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_json_manifest() {
        let json = r#"{
            "id": "dice",
            "name": "Dice",
            "version": "0.3.0",
            "author": "someone",
            "main": "dice.toml",
            "dependencies": [{ "name": "rng" }]
        }"#;
        let manifest = PluginManifest::parse(&PathBuf::from("plugin.json"), json).unwrap();
        assert_eq!(manifest.dependencies[0].version, "");
        assert!(!manifest.dependencies[0].optional);
    }

    #[test]
    fn test_malformed_manifest_reports_path() {
        let err = PluginManifest::parse(&PathBuf::from("x/plugin.toml"), "id = [").unwrap_err();
        match err {
            PluginError::ManifestParseError { path, .. } => {
                assert_eq!(path, PathBuf::from("x/plugin.toml"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!(Permission::parse("network"), Some(Permission::Network(None)));
        assert_eq!(
            Permission::parse("network:api.example.com"),
            Some(Permission::Network(Some("api.example.com".into())))
        );
        assert_eq!(
            Permission::parse("filesystem:data"),
            Some(Permission::Filesystem(Some("data".into())))
        );
        assert_eq!(Permission::parse("filesystem:"), Some(Permission::Filesystem(None)));
        assert_eq!(Permission::parse("telepathy"), None);
    }

    #[test]
    fn test_manifest_toml_round_trip() {
        let mut manifest = PluginManifest::new("echo", "Echo", "1.0.0", "me", "echo.toml");
        manifest.dependencies.push(Dependency::optional("log", "*"));
        let text = toml::to_string(&manifest).unwrap();
        let parsed: PluginManifest = toml::from_str(&text).unwrap();
        assert_eq!(parsed, manifest);
    }
}
