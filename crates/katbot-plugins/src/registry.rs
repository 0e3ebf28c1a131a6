//! Plugin registry.
//!
//! Versioned metadata store for known plugins: install and enable flags,
//! the dependency graph with per-node depth, version history and search.
//! The registry holds manifests only; live module instances belong to the
//! [`PluginManager`](crate::manager::PluginManager).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::marketplace::{Marketplace, MarketplaceListing, MarketplacePage, UnconfiguredMarketplace};
use crate::plugin::PluginId;
use crate::version::{Compatibility, Version};

/// Snapshot format version.
const SCHEMA_VERSION: u32 = 1;

/// Registry record for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// The registered manifest.
    pub manifest: PluginManifest,
    /// First registration.
    pub registered_at: DateTime<Utc>,
    /// Latest registration or flag change.
    pub updated_at: DateTime<Utc>,
    /// Whether the plugin is installed.
    pub installed: bool,
    /// Whether the plugin is enabled.
    pub enabled: bool,
    /// Where the plugin was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A registered plugin's place in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// The plugin.
    pub plugin_id: String,
    /// Its registered version.
    pub version: String,
    /// Declared dependency ids, registered or not.
    pub dependencies: Vec<String>,
    /// Registered plugins that declare this one as a dependency.
    pub dependents: Vec<String>,
    /// 1 + the deepest registered dependency; 1 for a leaf.
    pub depth: usize,
}

/// One version seen for a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// The version string.
    pub version: String,
    /// When it was registered.
    pub recorded_at: DateTime<Utc>,
}

/// Nested expansion of a plugin's dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTree {
    /// The plugin at this node.
    pub plugin_id: String,
    /// Its version, empty when not registered.
    pub version: String,
    /// Whether the plugin is absent from the registry.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub missing: bool,
    /// Whether expansion stopped because this id is already on the path.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cycle: bool,
    /// Expanded dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyTree>,
}

impl DependencyTree {
    fn render(&self, prefix: &str, out: &mut String) {
        let mut label = if self.version.is_empty() {
            self.plugin_id.clone()
        } else {
            format!("{}@{}", self.plugin_id, self.version)
        };
        if self.missing {
            label.push_str(" (missing)");
        }
        if self.cycle {
            label.push_str(" (cycle)");
        }
        out.push_str(prefix);
        out.push_str(&label);
        out.push('\n');
        let child_prefix = format!("{prefix}  ");
        for dep in &self.dependencies {
            dep.render(&child_prefix, out);
        }
    }
}

impl fmt::Display for DependencyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render("", &mut out);
        f.write_str(out.trim_end())
    }
}

/// Registry search parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text matched against name, id, description, author, tags,
    /// category and keywords. Empty matches everything that passes the
    /// filters.
    #[serde(default)]
    pub text: String,
    /// Only plugins in this category.
    #[serde(default)]
    pub category: Option<String>,
    /// Only plugins carrying all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Only enabled plugins.
    #[serde(default)]
    pub enabled_only: bool,
}

impl SearchQuery {
    /// A free-text query.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Plugin id.
    pub plugin_id: String,
    /// Display name.
    pub name: String,
    /// Registered version.
    pub version: String,
    /// Relevance; higher is better.
    pub score: u32,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    entries: Vec<RegistryEntry>,
    #[serde(default)]
    history: BTreeMap<String, Vec<VersionRecord>>,
}

/// Registry of known plugins.
pub struct PluginRegistry {
    entries: BTreeMap<PluginId, RegistryEntry>,
    graph: BTreeMap<String, DependencyNode>,
    history: BTreeMap<String, Vec<VersionRecord>>,
    marketplace: Arc<dyn Marketplace>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create an empty registry with no marketplace configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            graph: BTreeMap::new(),
            history: BTreeMap::new(),
            marketplace: Arc::new(UnconfiguredMarketplace),
        }
    }

    /// Use `marketplace` for remote lookups.
    #[must_use]
    pub fn with_marketplace(mut self, marketplace: Arc<dyn Marketplace>) -> Self {
        self.marketplace = marketplace;
        self
    }

    /// Register a manifest, or update the existing entry in place.
    ///
    /// Re-registering keeps `registered_at` and the install and enable flags
    /// and appends the version to the history when it changed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] for a malformed id, or
    /// [`PluginError::CircularDependency`] if the registration would close a
    /// dependency cycle; the registry is left unchanged in that case.
    pub fn register_plugin(&mut self, manifest: PluginManifest, source: Option<String>) -> PluginResult<()> {
        let id = manifest.plugin_id()?;
        let now = Utc::now();
        let version = manifest.version.clone();

        let previous_entry = self.entries.get(&id).cloned();
        let previous_history = self.history.get(id.as_str()).cloned();

        let entry = match previous_entry.clone() {
            Some(mut existing) => {
                existing.manifest = manifest;
                existing.updated_at = now;
                if source.is_some() {
                    existing.source = source;
                }
                existing
            },
            None => RegistryEntry {
                manifest,
                registered_at: now,
                updated_at: now,
                installed: true,
                enabled: false,
                source,
            },
        };
        self.entries.insert(id.clone(), entry);

        let history = self.history.entry(id.as_str().to_string()).or_default();
        if history.last().is_none_or(|last| last.version != version) {
            history.push(VersionRecord {
                version: version.clone(),
                recorded_at: now,
            });
        }

        if let Err(e) = self.rebuild_graph() {
            match previous_entry {
                Some(entry) => {
                    self.entries.insert(id.clone(), entry);
                },
                None => {
                    self.entries.remove(&id);
                },
            }
            match previous_history {
                Some(h) => {
                    self.history.insert(id.as_str().to_string(), h);
                },
                None => {
                    self.history.remove(id.as_str());
                },
            }
            if let Err(restore) = self.rebuild_graph() {
                warn!(plugin_id = %id, error = %restore, "Registry graph rebuild failed after rollback");
            }
            return Err(e);
        }

        info!(plugin_id = %id, version = %version, "Registered plugin");
        Ok(())
    }

    /// Remove a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if absent, or
    /// [`PluginError::HasDependents`] while another registered plugin
    /// lists it as a non-optional dependency.
    pub fn unregister_plugin(&mut self, id: &PluginId) -> PluginResult<RegistryEntry> {
        if !self.entries.contains_key(id) {
            return Err(PluginError::NotFound(id.clone()));
        }
        let dependents = self.get_dependents(id);
        if !dependents.is_empty() {
            return Err(PluginError::HasDependents {
                plugin_id: id.clone(),
                dependents,
            });
        }

        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        self.history.remove(id.as_str());
        if let Err(e) = self.rebuild_graph() {
            warn!(plugin_id = %id, error = %e, "Registry graph rebuild failed after unregister");
        }
        info!(plugin_id = %id, "Unregistered plugin");
        Ok(entry)
    }

    /// Registered plugins that list `id` as a non-optional dependency, sorted.
    #[must_use]
    pub fn get_dependents(&self, id: &PluginId) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(other, _)| *other != id)
            .filter(|(_, entry)| {
                entry
                    .manifest
                    .dependencies
                    .iter()
                    .any(|d| !d.optional && d.name == id.as_str())
            })
            .map(|(other, _)| other.to_string())
            .collect()
    }

    /// The registry entry for `id`.
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &PluginId) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered manifests keyed by id, as input for dependency resolution.
    #[must_use]
    pub fn known_manifests(&self) -> HashMap<String, PluginManifest> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.to_string(), entry.manifest.clone()))
            .collect()
    }

    /// Mark a plugin enabled or disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if absent.
    pub fn set_enabled(&mut self, id: &PluginId, enabled: bool) -> PluginResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        entry.enabled = enabled;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a plugin installed or uninstalled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if absent.
    pub fn set_installed(&mut self, id: &PluginId, installed: bool) -> PluginResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        entry.installed = installed;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Versions registered for `id`, oldest first.
    #[must_use]
    pub fn version_history(&self, id: &PluginId) -> &[VersionRecord] {
        self.history.get(id.as_str()).map_or(&[], Vec::as_slice)
    }

    /// The dependency graph node for `id`.
    #[must_use]
    pub fn dependency_node(&self, id: &PluginId) -> Option<&DependencyNode> {
        self.graph.get(id.as_str())
    }

    /// Search registered plugins, best match first.
    ///
    /// Scores are additive: exact name 100, name substring 50, id 40,
    /// description 20, author 15, each equal tag 25, category 30 and each
    /// matching keyword 10. Only hits with a positive score are returned.
    #[must_use]
    pub fn search_plugins(&self, query: &SearchQuery) -> Vec<SearchResult> {
        let text = query.text.trim().to_lowercase();
        let mut results: Vec<SearchResult> = self
            .entries
            .values()
            .filter(|entry| passes_filters(entry, query))
            .filter_map(|entry| {
                let score = if text.is_empty() {
                    1
                } else {
                    score(&entry.manifest, &text)
                };
                (score > 0).then(|| SearchResult {
                    plugin_id: entry.manifest.id.clone(),
                    name: entry.manifest.name.clone(),
                    version: entry.manifest.version.clone(),
                    score,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.plugin_id.cmp(&b.plugin_id)));
        results
    }

    /// Expand `id`'s dependencies recursively.
    ///
    /// Returns `None` if `id` is not registered. Ids already on the current
    /// path are marked as cycles and not expanded further.
    #[must_use]
    pub fn get_dependency_tree(&self, id: &PluginId) -> Option<DependencyTree> {
        if !self.entries.contains_key(id) {
            return None;
        }
        let mut path = Vec::new();
        Some(self.expand(id.as_str(), &mut path))
    }

    fn expand(&self, id: &str, path: &mut Vec<String>) -> DependencyTree {
        let entry = PluginId::new(id).ok().and_then(|pid| self.entries.get(&pid));
        let Some(entry) = entry else {
            return DependencyTree {
                plugin_id: id.to_string(),
                version: String::new(),
                missing: true,
                cycle: false,
                dependencies: Vec::new(),
            };
        };
        if path.iter().any(|p| p == id) {
            return DependencyTree {
                plugin_id: id.to_string(),
                version: entry.manifest.version.clone(),
                missing: false,
                cycle: true,
                dependencies: Vec::new(),
            };
        }

        path.push(id.to_string());
        let dependencies = entry
            .manifest
            .dependencies
            .iter()
            .map(|dep| self.expand(&dep.name, path))
            .collect();
        path.pop();

        DependencyTree {
            plugin_id: id.to_string(),
            version: entry.manifest.version.clone(),
            missing: false,
            cycle: false,
            dependencies,
        }
    }

    /// Check a host version against the plugin's declared bounds.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if absent.
    pub fn check_version_compatibility(
        &self,
        id: &PluginId,
        host_version: &Version,
    ) -> PluginResult<Compatibility> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        Ok(Compatibility::check(
            host_version,
            entry.manifest.min_host_version.as_deref(),
            entry.manifest.max_host_version.as_deref(),
        ))
    }

    /// Search the marketplace.
    ///
    /// # Errors
    ///
    /// Propagates the marketplace's error.
    pub async fn search_marketplace(
        &self,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> PluginResult<MarketplacePage> {
        self.marketplace.search(query, page, page_size).await
    }

    /// Look up a marketplace listing.
    ///
    /// # Errors
    ///
    /// Propagates the marketplace's error.
    pub async fn marketplace_plugin(&self, id: &str) -> PluginResult<Option<MarketplaceListing>> {
        self.marketplace.get_plugin(id).await
    }

    /// Marketplace categories.
    ///
    /// # Errors
    ///
    /// Propagates the marketplace's error.
    pub async fn marketplace_categories(&self) -> PluginResult<Vec<String>> {
        self.marketplace.get_categories().await
    }

    /// Write a JSON snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the snapshot cannot be written.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let snapshot = Snapshot {
            schema_version: SCHEMA_VERSION,
            entries: self.entries.values().cloned().collect(),
            history: self.history.clone(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| PluginError::Registry(format!("failed to serialize snapshot: {e}")))?;

        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            PluginError::Registry(format!("failed to create {}: {e}", parent.display()))
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| PluginError::Registry(format!("failed to create temp file: {e}")))?;
        tmp.write_all(&body)
            .map_err(|e| PluginError::Registry(format!("failed to write snapshot: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| PluginError::Registry(format!("failed to sync snapshot: {e}")))?;
        tmp.persist(path)
            .map_err(|e| PluginError::Registry(format!("failed to replace {}: {e}", path.display())))?;

        debug!(path = %path.display(), entries = self.entries.len(), "Saved registry snapshot");
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    ///
    /// The marketplace is not part of the snapshot and starts unconfigured.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Registry`] if the file cannot be read or
    /// parsed, or a graph error if the snapshot contains a cycle.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read(path)
            .map_err(|e| PluginError::Registry(format!("failed to read {}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_slice(&content)
            .map_err(|e| PluginError::Registry(format!("failed to parse {}: {e}", path.display())))?;
        if snapshot.schema_version != SCHEMA_VERSION {
            warn!(
                path = %path.display(),
                found = snapshot.schema_version,
                expected = SCHEMA_VERSION,
                "Registry snapshot schema mismatch, attempting best-effort load"
            );
        }

        let mut registry = Self::new();
        for entry in snapshot.entries {
            let id = entry.manifest.plugin_id()?;
            registry.entries.insert(id, entry);
        }
        registry.history = snapshot.history;
        registry.rebuild_graph()?;
        debug!(path = %path.display(), entries = registry.entries.len(), "Loaded registry snapshot");
        Ok(registry)
    }

    /// Recompute every node's dependents and depth.
    fn rebuild_graph(&mut self) -> PluginResult<()> {
        let mut graph: BTreeMap<String, DependencyNode> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let node = DependencyNode {
                    plugin_id: id.to_string(),
                    version: entry.manifest.version.clone(),
                    dependencies: entry.manifest.dependency_names().map(ToString::to_string).collect(),
                    dependents: Vec::new(),
                    depth: 0,
                };
                (id.to_string(), node)
            })
            .collect();

        let edges: Vec<(String, String)> = graph
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(|dep| (node.plugin_id.clone(), dep.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (from, to) in edges {
            if let Some(target) = graph.get_mut(&to) {
                if !target.dependents.contains(&from) {
                    target.dependents.push(from);
                }
            }
        }

        let mut depths: HashMap<String, usize> = HashMap::new();
        let ids: Vec<String> = graph.keys().cloned().collect();
        for id in &ids {
            let mut stack = Vec::new();
            depth_of(id, &graph, &mut depths, &mut stack)?;
        }
        for (id, node) in &mut graph {
            node.depth = depths.get(id).copied().unwrap_or(1);
        }

        self.graph = graph;
        Ok(())
    }
}

fn depth_of(
    id: &str,
    graph: &BTreeMap<String, DependencyNode>,
    depths: &mut HashMap<String, usize>,
    stack: &mut Vec<String>,
) -> PluginResult<usize> {
    if let Some(depth) = depths.get(id) {
        return Ok(*depth);
    }
    if let Some(start) = stack.iter().position(|s| s == id) {
        let mut path: Vec<String> = stack.get(start..).unwrap_or_default().to_vec();
        path.push(id.to_string());
        return Err(PluginError::CircularDependency { path });
    }
    let Some(node) = graph.get(id) else {
        return Ok(0);
    };

    stack.push(id.to_string());
    let mut deepest = 0;
    let mut seen = HashSet::new();
    for dep in &node.dependencies {
        if seen.insert(dep.as_str()) && graph.contains_key(dep) {
            deepest = deepest.max(depth_of(dep, graph, depths, stack)?);
        }
    }
    stack.pop();

    let depth = deepest.saturating_add(1);
    depths.insert(id.to_string(), depth);
    Ok(depth)
}

fn passes_filters(entry: &RegistryEntry, query: &SearchQuery) -> bool {
    if query.enabled_only && !entry.enabled {
        return false;
    }
    if let Some(category) = &query.category {
        let matches = entry
            .manifest
            .category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(category));
        if !matches {
            return false;
        }
    }
    query.tags.iter().all(|wanted| {
        entry
            .manifest
            .tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case(wanted))
    })
}

fn score(manifest: &PluginManifest, text: &str) -> u32 {
    let mut score: u32 = 0;
    let name = manifest.name.to_lowercase();
    if name == text {
        score = score.saturating_add(100);
    } else if name.contains(text) {
        score = score.saturating_add(50);
    }
    if manifest.id.to_lowercase().contains(text) {
        score = score.saturating_add(40);
    }
    if manifest
        .description
        .as_deref()
        .is_some_and(|d| d.to_lowercase().contains(text))
    {
        score = score.saturating_add(20);
    }
    if manifest.author.to_lowercase().contains(text) {
        score = score.saturating_add(15);
    }
    for tag in &manifest.tags {
        if tag.to_lowercase() == text {
            score = score.saturating_add(25);
        }
    }
    if manifest
        .category
        .as_deref()
        .is_some_and(|c| c.to_lowercase() == text)
    {
        score = score.saturating_add(30);
    }
    for keyword in &manifest.keywords {
        if keyword.to_lowercase().contains(text) {
            score = score.saturating_add(10);
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Dependency;

    fn manifest(id: &str, version: &str, deps: Vec<Dependency>) -> PluginManifest {
        let mut m = PluginManifest::new(id, id, version, "tester", "main.toml");
        m.dependencies = deps;
        m
    }

    fn pid(id: &str) -> PluginId {
        PluginId::from_static(id)
    }

    #[test]
    fn test_register_is_idempotent_and_tracks_history() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(manifest("dice", "1.0.0", vec![]), None).unwrap();
        let first = registry.get(&pid("dice")).unwrap().registered_at;
        registry.set_enabled(&pid("dice"), true).unwrap();

        registry.register_plugin(manifest("dice", "1.0.0", vec![]), None).unwrap();
        registry
            .register_plugin(manifest("dice", "1.1.0", vec![]), Some("/plugins/dice".into()))
            .unwrap();

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&pid("dice")).unwrap();
        assert_eq!(entry.registered_at, first);
        assert!(entry.enabled);
        assert_eq!(entry.manifest.version, "1.1.0");
        assert_eq!(entry.source.as_deref(), Some("/plugins/dice"));
        let versions: Vec<&str> = registry
            .version_history(&pid("dice"))
            .iter()
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(versions, vec!["1.0.0", "1.1.0"]);
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry.register_plugin(manifest("../x", "1.0.0", vec![]), None).unwrap_err();
        assert!(matches!(err, PluginError::InvalidId(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_with_dependents() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(manifest("b", "1.0.5", vec![]), None).unwrap();
        registry
            .register_plugin(manifest("a", "1.0.0", vec![Dependency::required("b", "^1.0.0")]), None)
            .unwrap();
        registry
            .register_plugin(manifest("c", "1.0.0", vec![Dependency::optional("b", "*")]), None)
            .unwrap();

        assert_eq!(registry.get_dependents(&pid("b")), vec!["a".to_string()]);
        let err = registry.unregister_plugin(&pid("b")).unwrap_err();
        assert!(matches!(err, PluginError::HasDependents { .. }));
        assert!(registry.contains(&pid("b")));

        registry.unregister_plugin(&pid("a")).unwrap();
        registry.unregister_plugin(&pid("b")).unwrap();
        assert!(matches!(
            registry.unregister_plugin(&pid("b")),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn test_graph_depth_and_dependents() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(manifest("log", "1.0.0", vec![]), None).unwrap();
        registry
            .register_plugin(manifest("http", "1.0.0", vec![Dependency::required("log", "*")]), None)
            .unwrap();
        registry
            .register_plugin(
                manifest(
                    "web",
                    "1.0.0",
                    vec![Dependency::required("http", "*"), Dependency::required("ghost", "*")],
                ),
                None,
            )
            .unwrap();
        registry
            .register_plugin(manifest("solo", "1.0.0", vec![Dependency::required("ghost", "*")]), None)
            .unwrap();

        assert_eq!(registry.dependency_node(&pid("log")).unwrap().depth, 1);
        assert_eq!(registry.dependency_node(&pid("http")).unwrap().depth, 2);
        assert_eq!(registry.dependency_node(&pid("web")).unwrap().depth, 3);
        assert_eq!(registry.dependency_node(&pid("solo")).unwrap().depth, 1);
        assert_eq!(registry.dependency_node(&pid("log")).unwrap().dependents, vec!["http".to_string()]);
        assert_eq!(
            registry.dependency_node(&pid("web")).unwrap().dependencies,
            vec!["http".to_string(), "ghost".to_string()]
        );
    }

    #[test]
    fn test_cycle_is_rejected_and_rolled_back() {
        let mut registry = PluginRegistry::new();
        registry
            .register_plugin(manifest("a", "1.0.0", vec![Dependency::required("b", "*")]), None)
            .unwrap();
        registry.register_plugin(manifest("b", "1.0.0", vec![]), None).unwrap();

        let err = registry
            .register_plugin(manifest("b", "2.0.0", vec![Dependency::required("a", "*")]), None)
            .unwrap_err();
        assert!(matches!(err, PluginError::CircularDependency { .. }));
        assert_eq!(registry.get(&pid("b")).unwrap().manifest.version, "1.0.0");
        assert_eq!(registry.version_history(&pid("b")).len(), 1);
        assert_eq!(registry.dependency_node(&pid("a")).unwrap().depth, 2);
    }

    #[test]
    fn test_search_scoring() {
        let mut registry = PluginRegistry::new();
        let mut dice = manifest("dice", "1.0.0", vec![]);
        dice.name = "Dice".into();
        dice.tags = vec!["games".into()];
        dice.category = Some("fun".into());
        let mut dice_stats = manifest("dice-stats", "1.0.0", vec![]);
        dice_stats.name = "Dice Stats".into();
        dice_stats.keywords = vec!["dice".into()];
        let mut weather = manifest("weather", "1.0.0", vec![]);
        weather.name = "Weather".into();
        weather.category = Some("utility".into());
        for m in [dice, dice_stats, weather] {
            registry.register_plugin(m, None).unwrap();
        }

        let hits = registry.search_plugins(&SearchQuery::text("dice"));
        let ids: Vec<&str> = hits.iter().map(|h| h.plugin_id.as_str()).collect();
        assert_eq!(ids, vec!["dice", "dice-stats"]);
        assert_eq!(hits[0].score, 140);
        assert_eq!(hits[1].score, 100);

        let hits = registry.search_plugins(&SearchQuery::text("games"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 25);

        let filtered = registry.search_plugins(&SearchQuery {
            category: Some("utility".into()),
            ..SearchQuery::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].plugin_id, "weather");

        assert!(registry.search_plugins(&SearchQuery::text("zzz")).is_empty());
    }

    #[test]
    fn test_dependency_tree() {
        let mut registry = PluginRegistry::new();
        registry
            .register_plugin(manifest("a", "1.0.0", vec![Dependency::required("b", "*")]), None)
            .unwrap();
        registry
            .register_plugin(
                manifest("b", "1.2.0", vec![Dependency::required("ghost", "*")]),
                None,
            )
            .unwrap();

        let tree = registry.get_dependency_tree(&pid("a")).unwrap();
        assert_eq!(tree.dependencies.len(), 1);
        assert_eq!(tree.dependencies[0].version, "1.2.0");
        assert!(tree.dependencies[0].dependencies[0].missing);
        assert_eq!(tree.to_string(), "a@1.0.0\n  b@1.2.0\n    ghost (missing)");
        assert!(registry.get_dependency_tree(&pid("ghost")).is_none());
    }

    #[test]
    fn test_version_compatibility() {
        let mut registry = PluginRegistry::new();
        let mut m = manifest("a", "1.0.0", vec![]);
        m.min_host_version = Some("1.0.0".into());
        m.max_host_version = Some("1.9.9".into());
        registry.register_plugin(m, None).unwrap();

        assert!(registry
            .check_version_compatibility(&pid("a"), &Version::new(1, 5, 0))
            .unwrap()
            .compatible);
        assert!(!registry
            .check_version_compatibility(&pid("a"), &Version::new(2, 0, 0))
            .unwrap()
            .compatible);
        assert!(registry
            .check_version_compatibility(&pid("zz"), &Version::new(1, 0, 0))
            .is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");

        let mut registry = PluginRegistry::new();
        registry.register_plugin(manifest("b", "1.0.0", vec![]), None).unwrap();
        registry
            .register_plugin(manifest("a", "1.0.0", vec![Dependency::required("b", "*")]), None)
            .unwrap();
        registry.set_installed(&pid("a"), false).unwrap();
        registry.save(&path).unwrap();

        let loaded = PluginRegistry::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.get(&pid("a")).unwrap().installed);
        assert_eq!(loaded.dependency_node(&pid("a")).unwrap().depth, 2);
        assert_eq!(loaded.version_history(&pid("b")).len(), 1);

        assert!(PluginRegistry::load(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn test_marketplace_delegates_to_stub() {
        let registry = PluginRegistry::new();
        let err = registry.search_marketplace("dice", 1, 10).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotImplemented);
    }
}
