//! Plugin discovery and loading.
//!
//! The loader turns a source into a ready-to-run module:
//!
//! ```text
//! locate (strategy) → read manifest → validate → security scan
//!   → resolve dependencies → host version check → instantiate (strategy)
//! ```
//!
//! Sources are handled by a [`LoadStrategy`] keyed by [`SourceType`]. Only
//! local directories are implemented; remote URLs and archives fail with
//! [`PluginError::NotImplemented`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE_NAME, MANIFEST_JSON_FILE_NAME, PluginManifest};
use crate::module::{DeclarativeModule, ModuleCatalog, PluginModule};
use crate::plugin::PluginId;
use crate::resolver::DependencyResolver;
use crate::scan::scan_source;
use crate::storage::PluginStorage;
use crate::validate::ManifestValidator;
use crate::version::{Compatibility, HostVersionProvider, Version};

/// Where a plugin is loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// A directory on local storage.
    LocalPath,
    /// An `http(s)://` URL.
    RemoteUrl,
    /// A packaged archive file.
    Archive,
}

impl SourceType {
    /// Guess the type from the shape of `source`.
    #[must_use]
    pub fn infer(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::RemoteUrl
        } else if [".zip", ".tar.gz", ".tgz", ".tar"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Self::Archive
        } else {
            Self::LocalPath
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocalPath => "local-path",
            Self::RemoteUrl => "remote-url",
            Self::Archive => "archive",
        })
    }
}

/// How plugins from one kind of source are fetched and instantiated.
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    /// The source type served.
    fn source_type(&self) -> SourceType;

    /// Resolve `source` to a local plugin directory.
    async fn locate(&self, source: &str) -> PluginResult<PathBuf>;

    /// Build the module for a validated manifest.
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
    ) -> PluginResult<Arc<dyn PluginModule>>;
}

/// Loads plugins from directories on [`PluginStorage`].
///
/// The manifest `main` entry is looked up in the [`ModuleCatalog`] first;
/// otherwise an entry ending in `.toml` is read as a [`DeclarativeModule`].
pub struct LocalPathStrategy {
    storage: Arc<dyn PluginStorage>,
    catalog: ModuleCatalog,
}

impl fmt::Debug for LocalPathStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPathStrategy")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl LocalPathStrategy {
    /// Create the strategy.
    #[must_use]
    pub fn new(storage: Arc<dyn PluginStorage>, catalog: ModuleCatalog) -> Self {
        Self { storage, catalog }
    }
}

#[async_trait]
impl LoadStrategy for LocalPathStrategy {
    fn source_type(&self) -> SourceType {
        SourceType::LocalPath
    }

    async fn locate(&self, source: &str) -> PluginResult<PathBuf> {
        let dir = PathBuf::from(source);
        if !self.storage.exists(&dir).await {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("plugin source {source} does not exist"),
            )));
        }
        Ok(dir)
    }

    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
    ) -> PluginResult<Arc<dyn PluginModule>> {
        let plugin_id = manifest.plugin_id()?;
        let load_err = |message: String| PluginError::ModuleLoad {
            plugin_id: plugin_id.clone(),
            message,
        };

        if let Some(factory) = self.catalog.get(&manifest.main) {
            debug!(plugin_id = %plugin_id, entry = %manifest.main, "Instantiating native module");
            return factory(manifest).map_err(|e| load_err(e.to_string()));
        }

        if !manifest.main.ends_with(".toml") {
            return Err(load_err(format!(
                "no native module registered for entry '{}'",
                manifest.main
            )));
        }
        let entry = entry_path(dir, &manifest.main).ok_or_else(|| {
            load_err(format!("entry '{}' escapes the plugin directory", manifest.main))
        })?;
        let source = self
            .storage
            .read_to_string(&entry)
            .await
            .map_err(|e| load_err(format!("failed to read {}: {e}", entry.display())))?;
        let module = DeclarativeModule::parse(&source).map_err(|e| load_err(e.to_string()))?;
        debug!(plugin_id = %plugin_id, entry = %entry.display(), "Instantiated declarative module");
        Ok(Arc::new(module))
    }
}

/// Placeholder for a source type without an implementation.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedStrategy(pub SourceType);

#[async_trait]
impl LoadStrategy for UnsupportedStrategy {
    fn source_type(&self) -> SourceType {
        self.0
    }

    async fn locate(&self, _source: &str) -> PluginResult<PathBuf> {
        Err(PluginError::NotImplemented(format!("loading from {}", self.0)))
    }

    async fn instantiate(
        &self,
        _manifest: &PluginManifest,
        _dir: &Path,
    ) -> PluginResult<Arc<dyn PluginModule>> {
        Err(PluginError::NotImplemented(format!("instantiating from {}", self.0)))
    }
}

/// `dir/main`, or `None` if `main` is absolute or climbs out of `dir`.
fn entry_path(dir: &Path, main: &str) -> Option<PathBuf> {
    let main = Path::new(main);
    main.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then(|| dir.join(main))
}

/// A plugin directory with a valid manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    /// The parsed manifest.
    pub manifest: PluginManifest,
    /// The directory holding it.
    pub dir: PathBuf,
}

/// A directory that could not be discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    /// The directory.
    pub path: PathBuf,
    /// Why it was skipped.
    pub error: String,
}

/// Result of scanning a plugin root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Valid plugins, ordered by directory.
    pub discovered: Vec<DiscoveredPlugin>,
    /// Per-directory failures.
    pub failed: Vec<DiscoveryFailure>,
}

/// A successfully loaded plugin, ready to be owned by the manager.
#[derive(Clone)]
pub struct LoadedPlugin {
    /// Validated plugin id.
    pub plugin_id: PluginId,
    /// The manifest.
    pub manifest: PluginManifest,
    /// The plugin's directory.
    pub dir: PathBuf,
    /// The source string it was loaded from.
    pub source: String,
    /// How it was loaded.
    pub source_type: SourceType,
    /// The instantiated module.
    pub module: Arc<dyn PluginModule>,
    /// Dependencies first, this plugin last.
    pub load_order: Vec<String>,
    /// Validation, scan and resolution warnings.
    pub warnings: Vec<String>,
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("plugin_id", &self.plugin_id)
            .field("dir", &self.dir)
            .field("source_type", &self.source_type)
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct LoadRecord {
    source: String,
    source_type: SourceType,
    dir: PathBuf,
}

/// Discovers and loads plugins.
pub struct PluginLoader {
    storage: Arc<dyn PluginStorage>,
    strategies: HashMap<SourceType, Arc<dyn LoadStrategy>>,
    host: Arc<dyn HostVersionProvider>,
    block_high_severity: bool,
    loaded: DashMap<PluginId, LoadRecord>,
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.loaded.len())
            .field("block_high_severity", &self.block_high_severity)
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// A loader with the local-path strategy over `storage` and
    /// not-implemented strategies for remote URLs and archives.
    #[must_use]
    pub fn new(
        storage: Arc<dyn PluginStorage>,
        catalog: ModuleCatalog,
        host: Arc<dyn HostVersionProvider>,
    ) -> Self {
        let mut strategies: HashMap<SourceType, Arc<dyn LoadStrategy>> = HashMap::new();
        strategies.insert(
            SourceType::LocalPath,
            Arc::new(LocalPathStrategy::new(Arc::clone(&storage), catalog)),
        );
        strategies.insert(SourceType::RemoteUrl, Arc::new(UnsupportedStrategy(SourceType::RemoteUrl)));
        strategies.insert(SourceType::Archive, Arc::new(UnsupportedStrategy(SourceType::Archive)));
        Self {
            storage,
            strategies,
            host,
            block_high_severity: true,
            loaded: DashMap::new(),
        }
    }

    /// Replace the strategy for its source type.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn LoadStrategy>) -> Self {
        self.strategies.insert(strategy.source_type(), strategy);
        self
    }

    /// Whether critical and high scan findings block loading.
    #[must_use]
    pub fn with_block_high_severity(mut self, block: bool) -> Self {
        self.block_high_severity = block;
        self
    }

    /// The host version plugins are checked against.
    #[must_use]
    pub fn host_version(&self) -> Version {
        self.host.host_version()
    }

    /// Read `plugin.toml`, falling back to `plugin.json`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParseError`] if neither exists or the
    /// one found does not parse.
    pub async fn read_manifest(&self, dir: &Path) -> PluginResult<PluginManifest> {
        for name in [MANIFEST_FILE_NAME, MANIFEST_JSON_FILE_NAME] {
            let path = dir.join(name);
            if !self.storage.exists(&path).await {
                continue;
            }
            let content = self
                .storage
                .read_to_string(&path)
                .await
                .map_err(|e| PluginError::ManifestParseError {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            return PluginManifest::parse(&path, &content);
        }
        Err(PluginError::ManifestParseError {
            path: dir.to_path_buf(),
            message: format!("no {MANIFEST_FILE_NAME} or {MANIFEST_JSON_FILE_NAME} found"),
        })
    }

    /// Locate `source` and read its manifest without loading anything.
    ///
    /// # Errors
    ///
    /// Returns the strategy's locate error or a manifest parse error.
    pub async fn peek_manifest(
        &self,
        source: &str,
        source_type: SourceType,
    ) -> PluginResult<PluginManifest> {
        let strategy = self
            .strategies
            .get(&source_type)
            .ok_or_else(|| PluginError::NotImplemented(format!("loading from {source_type}")))?;
        let dir = strategy.locate(source).await?;
        self.read_manifest(&dir).await
    }

    /// Scan each subdirectory of `root` for a valid manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if `root` itself cannot be listed.
    /// Individual directories never fail the scan.
    pub async fn discover_plugins(&self, root: &Path) -> PluginResult<DiscoveryReport> {
        let dirs = self.storage.list_dirs(root).await?;
        let mut report = DiscoveryReport::default();

        for dir in dirs {
            let outcome = match self.read_manifest(&dir).await {
                Ok(manifest) => ManifestValidator::validate(&manifest)
                    .into_result()
                    .map(|_| manifest),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(manifest) => {
                    debug!(path = %dir.display(), plugin_id = %manifest.id, "Discovered plugin");
                    report.discovered.push(DiscoveredPlugin { manifest, dir });
                },
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping plugin directory");
                    report.failed.push(DiscoveryFailure {
                        path: dir,
                        error: e.to_string(),
                    });
                },
            }
        }

        info!(
            root = %root.display(),
            discovered = report.discovered.len(),
            failed = report.failed.len(),
            "Plugin discovery finished"
        );
        Ok(report)
    }

    /// Run the full load pipeline for `source`.
    ///
    /// `known` holds the manifests dependencies are resolved against.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error: [`PluginError::NotImplemented`]
    /// for unsupported sources, manifest parse or validation errors,
    /// [`PluginError::SecurityScan`], [`PluginError::DependencyResolution`],
    /// [`PluginError::IncompatibleHost`] or [`PluginError::ModuleLoad`].
    pub async fn load_from_source(
        &self,
        source: &str,
        source_type: SourceType,
        known: &HashMap<String, PluginManifest>,
    ) -> PluginResult<LoadedPlugin> {
        let strategy = self
            .strategies
            .get(&source_type)
            .ok_or_else(|| PluginError::NotImplemented(format!("loading from {source_type}")))?;

        let dir = strategy.locate(source).await?;
        let manifest = self.read_manifest(&dir).await?;
        let mut warnings = ManifestValidator::validate(&manifest).into_result()?;
        let plugin_id = manifest.plugin_id()?;

        warnings.extend(self.security_scan(&plugin_id, &manifest, &dir).await?);

        let resolution = DependencyResolver::resolve(&manifest, known);
        if !resolution.resolved {
            return Err(PluginError::DependencyResolution {
                plugin_id,
                missing: resolution.missing,
                conflicts: resolution.conflicts,
            });
        }
        warnings.extend(resolution.warnings);

        let host_version = self.host.host_version();
        let compat = Compatibility::check(
            &host_version,
            manifest.min_host_version.as_deref(),
            manifest.max_host_version.as_deref(),
        );
        if !compat.compatible {
            return Err(PluginError::IncompatibleHost {
                plugin_id,
                host_version: host_version.to_string(),
                reason: compat.reason.unwrap_or_default(),
            });
        }

        let module = strategy.instantiate(&manifest, &dir).await?;

        for warning in &warnings {
            warn!(plugin_id = %plugin_id, warning = %warning, "Plugin load warning");
        }
        self.loaded.insert(
            plugin_id.clone(),
            LoadRecord {
                source: source.to_string(),
                source_type,
                dir: dir.clone(),
            },
        );
        info!(plugin_id = %plugin_id, version = %manifest.version, source = %source, "Loaded plugin module");

        Ok(LoadedPlugin {
            plugin_id,
            manifest,
            dir,
            source: source.to_string(),
            source_type,
            module,
            load_order: resolution.load_order,
            warnings,
        })
    }

    /// Scan the entry file, if it is readable text. Returns the
    /// non-blocking findings as warnings.
    async fn security_scan(
        &self,
        plugin_id: &PluginId,
        manifest: &PluginManifest,
        dir: &Path,
    ) -> PluginResult<Vec<String>> {
        let Some(entry) = entry_path(dir, &manifest.main) else {
            return Ok(Vec::new());
        };
        if !self.storage.exists(&entry).await {
            return Ok(Vec::new());
        }
        let Ok(source) = self.storage.read_to_string(&entry).await else {
            debug!(plugin_id = %plugin_id, entry = %entry.display(), "Entry is not text, skipping scan");
            return Ok(Vec::new());
        };

        let report = scan_source(&source);
        if report.is_blocked() && self.block_high_severity {
            return Err(PluginError::SecurityScan {
                plugin_id: plugin_id.clone(),
                findings: report.blocking().map(|f| f.summary()).collect(),
            });
        }
        Ok(report
            .findings
            .iter()
            .map(|f| format!("security: {} ({})", f.summary(), f.remediation))
            .collect())
    }

    /// Whether `id` is tracked as loaded.
    #[must_use]
    pub fn is_loaded(&self, id: &PluginId) -> bool {
        self.loaded.contains_key(id)
    }

    /// Source string and type `id` was loaded from.
    #[must_use]
    pub fn loaded_source(&self, id: &PluginId) -> Option<(String, SourceType)> {
        self.loaded
            .get(id)
            .map(|r| (r.source.clone(), r.source_type))
    }

    /// Directory `id` was loaded from.
    #[must_use]
    pub fn loaded_dir(&self, id: &PluginId) -> Option<PathBuf> {
        self.loaded.get(id).map(|r| r.dir.clone())
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn remove(&self, id: &PluginId) -> bool {
        self.loaded.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;
    use crate::sandbox::ModuleContext;
    use crate::storage::FsStorage;
    use crate::version::StaticHostVersion;

    fn write_plugin(root: &Path, id: &str, manifest: &str, entry: Option<&str>) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest).unwrap();
        if let Some(entry) = entry {
            std::fs::write(dir.join("module.toml"), entry).unwrap();
        }
        dir
    }

    fn manifest_toml(id: &str, extra: &str) -> String {
        format!(
            "id = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nauthor = \"kat\"\nmain = \"module.toml\"\ndescription = \"test\"\n{extra}"
        )
    }

    fn loader(host: &str) -> PluginLoader {
        PluginLoader::new(
            Arc::new(FsStorage),
            ModuleCatalog::new(),
            Arc::new(StaticHostVersion::parse(host).unwrap()),
        )
    }

    #[test]
    fn test_source_type_inference() {
        assert_eq!(SourceType::infer("https://example.com/p"), SourceType::RemoteUrl);
        assert_eq!(SourceType::infer("/tmp/dice.tar.gz"), SourceType::Archive);
        assert_eq!(SourceType::infer("plugins/dice"), SourceType::LocalPath);
    }

    #[test]
    fn test_entry_path_rejects_escape() {
        let dir = Path::new("/p/dice");
        assert_eq!(entry_path(dir, "module.toml"), Some(dir.join("module.toml")));
        assert!(entry_path(dir, "../other/module.toml").is_none());
        assert!(entry_path(dir, "/etc/passwd").is_none());
    }

    #[tokio::test]
    async fn test_discover_reports_per_item_failures() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "dice", &manifest_toml("dice", ""), None);
        std::fs::create_dir(root.path().join("empty")).unwrap();
        write_plugin(root.path(), "broken", "id = ", None);
        write_plugin(
            root.path(),
            "badver",
            &manifest_toml("badver", "").replace("1.0.0", "one"),
            None,
        );
        let json_dir = root.path().join("weather");
        std::fs::create_dir(&json_dir).unwrap();
        std::fs::write(
            json_dir.join(MANIFEST_JSON_FILE_NAME),
            r#"{"id":"weather","name":"Weather","version":"2.0.0","author":"kat","main":"w"}"#,
        )
        .unwrap();

        let report = loader("1.0.0").discover_plugins(root.path()).await.unwrap();
        let ids: Vec<&str> = report.discovered.iter().map(|d| d.manifest.id.as_str()).collect();
        assert_eq!(ids, vec!["dice", "weather"]);
        assert_eq!(report.failed.len(), 3);
        assert!(report.failed.iter().any(|f| f.path.ends_with("empty")));

        assert!(loader("1.0.0").discover_plugins(&root.path().join("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_load_declarative_plugin() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(
            root.path(),
            "greeter",
            &manifest_toml("greeter", ""),
            Some("[commands.greet]\nreply = \"Hi {name}\"\n"),
        );

        let loaded = loader("1.0.0")
            .load_from_source(dir.to_str().unwrap(), SourceType::LocalPath, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(loaded.plugin_id.as_str(), "greeter");
        assert_eq!(loaded.load_order, vec!["greeter".to_string()]);

        let ctx = ModuleContext::unrestricted(loaded.plugin_id.clone(), dir, Version::new(1, 0, 0));
        let out = loaded.module.execute(&ctx, "greet", json!({"name": "Kat"})).await.unwrap();
        assert_eq!(out, json!("Hi Kat"));
    }

    #[tokio::test]
    async fn test_load_pipeline_failures() {
        let root = tempfile::tempdir().unwrap();
        let l = loader("1.0.0");
        let known = HashMap::new();

        let missing = write_plugin(
            root.path(),
            "needy",
            &manifest_toml("needy", "[[dependencies]]\nname = \"base\"\nversion = \"^1.0.0\"\n"),
            Some(""),
        );
        let err = l
            .load_from_source(missing.to_str().unwrap(), SourceType::LocalPath, &known)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DependencyResolutionFailed);

        let future = write_plugin(
            root.path(),
            "future",
            &manifest_toml("future", "min_host_version = \"2.0.0\"\n"),
            Some(""),
        );
        let err = l
            .load_from_source(future.to_str().unwrap(), SourceType::LocalPath, &known)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncompatibleHost);

        let evil = write_plugin(
            root.path(),
            "evil",
            &manifest_toml("evil", ""),
            Some("# eval(payload)\n"),
        );
        let err = l
            .load_from_source(evil.to_str().unwrap(), SourceType::LocalPath, &known)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SecurityScanFailed);
        assert!(!l.is_loaded(&PluginId::from_static("evil")));

        let native = write_plugin(
            root.path(),
            "native",
            &manifest_toml("native", "").replace("module.toml", "native_entry"),
            None,
        );
        let err = l
            .load_from_source(native.to_str().unwrap(), SourceType::LocalPath, &known)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModuleLoadError);
    }

    #[tokio::test]
    async fn test_unblocked_scan_becomes_warning() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(
            root.path(),
            "envy",
            &manifest_toml("envy", ""),
            Some("# reads process.env.HOME\n"),
        );
        let loaded = loader("1.0.0")
            .load_from_source(dir.to_str().unwrap(), SourceType::LocalPath, &HashMap::new())
            .await
            .unwrap();
        assert!(loaded.warnings.iter().any(|w| w.contains("environment-access")));
    }

    #[tokio::test]
    async fn test_remote_and_archive_not_implemented() {
        let l = loader("1.0.0");
        for (source, ty) in [
            ("https://example.com/dice", SourceType::RemoteUrl),
            ("dice.zip", SourceType::Archive),
        ] {
            let err = l.load_from_source(source, ty, &HashMap::new()).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::NotImplemented);
        }
    }

    #[tokio::test]
    async fn test_loaded_tracking() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_plugin(root.path(), "dice", &manifest_toml("dice", ""), Some(""));
        let l = loader("1.0.0");
        l.load_from_source(dir.to_str().unwrap(), SourceType::LocalPath, &HashMap::new())
            .await
            .unwrap();

        let id = PluginId::from_static("dice");
        assert!(l.is_loaded(&id));
        assert_eq!(l.loaded_dir(&id), Some(dir.clone()));
        assert_eq!(
            l.loaded_source(&id),
            Some((dir.to_str().unwrap().to_string(), SourceType::LocalPath))
        );
        assert!(l.remove(&id));
        assert!(!l.remove(&id));
    }
}
