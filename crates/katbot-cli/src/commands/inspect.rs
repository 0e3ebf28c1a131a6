//! Offline inspection of plugin directories.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use katbot_plugins::version::StaticHostVersion;
use katbot_plugins::{
    DependencyResolver, FsStorage, ManifestValidator, ModuleCatalog, PluginId, PluginLoader, PluginManifest,
    PluginRegistry, PluginSystemConfig, scan_source,
};

fn loader(config: &PluginSystemConfig) -> Result<PluginLoader> {
    let host = StaticHostVersion::new(config.host_version()?);
    Ok(PluginLoader::new(Arc::new(FsStorage), ModuleCatalog::new(), Arc::new(host)))
}

/// Valid manifests under the plugin directory, keyed by id.
async fn known_manifests(config: &PluginSystemConfig) -> Result<HashMap<String, PluginManifest>> {
    let report = loader(config)?
        .discover_plugins(&config.plugin_dir)
        .await
        .with_context(|| format!("failed to read {}", config.plugin_dir.display()))?;
    Ok(report
        .discovered
        .into_iter()
        .map(|d| (d.manifest.id.clone(), d.manifest))
        .collect())
}

pub(crate) async fn discover(config: &PluginSystemConfig) -> Result<()> {
    let report = loader(config)?
        .discover_plugins(&config.plugin_dir)
        .await
        .with_context(|| format!("failed to read {}", config.plugin_dir.display()))?;

    println!("{}", format!("Plugins in {}", config.plugin_dir.display()).cyan().bold());
    for found in &report.discovered {
        println!(
            "  {} {}@{}  {}",
            "OK".green(),
            found.manifest.id,
            found.manifest.version,
            found.dir.display().to_string().dimmed()
        );
    }
    for failure in &report.failed {
        println!("  {} {}: {}", "FAIL".red(), failure.path.display(), failure.error);
    }
    println!(
        "\n{} discovered, {} failed",
        report.discovered.len(),
        report.failed.len()
    );
    Ok(())
}

pub(crate) async fn validate(config: &PluginSystemConfig, path: &Path) -> Result<()> {
    let manifest = loader(config)?.read_manifest(path).await?;
    let report = ManifestValidator::validate(&manifest);

    for warning in &report.warnings {
        println!("  {} {warning}", "WARN".yellow());
    }
    for error in &report.errors {
        println!("  {} {error}", "ERROR".red());
    }
    if !report.valid {
        bail!("{} is invalid ({} errors)", path.display(), report.errors.len());
    }
    println!("{} {}@{} is valid", "OK".green(), manifest.id, manifest.version);
    Ok(())
}

pub(crate) async fn scan(config: &PluginSystemConfig, path: &Path) -> Result<()> {
    let manifest = loader(config)?.read_manifest(path).await?;
    let entry = path.join(&manifest.main);
    let source = tokio::fs::read_to_string(&entry)
        .await
        .with_context(|| format!("failed to read entry {}", entry.display()))?;
    let report = scan_source(&source);

    if report.findings.is_empty() {
        println!("{} no findings in {}", "OK".green(), entry.display());
        return Ok(());
    }
    for finding in &report.findings {
        let label = if finding.severity.is_blocking() {
            "BLOCK".red()
        } else {
            "WARN".yellow()
        };
        println!("  {label} {}", finding.summary());
        println!("    {}", finding.remediation.dimmed());
    }
    if report.is_blocked() {
        bail!("{} would be refused at load time", manifest.id);
    }
    Ok(())
}

pub(crate) async fn resolve(config: &PluginSystemConfig, id: &str) -> Result<()> {
    let known = known_manifests(config).await?;
    let manifest = known
        .get(id)
        .with_context(|| format!("plugin {id} not found in {}", config.plugin_dir.display()))?;
    let resolution = DependencyResolver::resolve(manifest, &known);

    for warning in &resolution.warnings {
        println!("  {} {warning}", "WARN".yellow());
    }
    for missing in &resolution.missing {
        println!("  {} missing {missing}", "ERROR".red());
    }
    for conflict in &resolution.conflicts {
        println!("  {} {conflict}", "ERROR".red());
    }
    if !resolution.resolved {
        bail!("dependencies of {id} cannot be resolved");
    }
    println!("{} load order: {}", "OK".green(), resolution.load_order.join(" -> "));
    Ok(())
}

pub(crate) async fn tree(config: &PluginSystemConfig, id: &str) -> Result<()> {
    let known = known_manifests(config).await?;
    let order = DependencyResolver::order_all(&known).unwrap_or_else(|cycle| {
        tracing::warn!(cycle = %cycle.join(" -> "), "Dependency cycle, registering in id order");
        let mut ids: Vec<String> = known.keys().cloned().collect();
        ids.sort();
        ids
    });

    let mut registry = PluginRegistry::new();
    for plugin in &order {
        if let Some(manifest) = known.get(plugin) {
            if let Err(e) = registry.register_plugin(manifest.clone(), None) {
                tracing::warn!(plugin_id = %plugin, error = %e, "Skipping plugin");
            }
        }
    }

    let plugin_id = PluginId::new(id)?;
    let tree = registry
        .get_dependency_tree(&plugin_id)
        .with_context(|| format!("plugin {id} not found in {}", config.plugin_dir.display()))?;
    print!("{tree}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, id: &str, extra: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                "id = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nauthor = \"kat\"\nmain = \"module.toml\"\n{extra}"
            ),
        )
        .unwrap();
        std::fs::write(dir.join("module.toml"), "[commands.ping]\nreply = \"pong\"\n").unwrap();
    }

    fn config(root: &TempDir) -> PluginSystemConfig {
        PluginSystemConfig {
            plugin_dir: root.path().to_path_buf(),
            ..PluginSystemConfig::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_reports_missing_dependency() {
        let root = TempDir::new().unwrap();
        write(root.path(), "base", "");
        write(root.path(), "app", "[[dependencies]]\nname = \"base\"\nversion = \"^1.0.0\"\n");
        write(root.path(), "orphan", "[[dependencies]]\nname = \"ghost\"\nversion = \"*\"\n");

        let config = config(&root);
        resolve(&config, "app").await.unwrap();
        assert!(resolve(&config, "orphan").await.is_err());
        assert!(resolve(&config, "nope").await.is_err());
        tree(&config, "app").await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_and_scan() {
        let root = TempDir::new().unwrap();
        write(root.path(), "base", "");
        let config = config(&root);
        validate(&config, &root.path().join("base")).await.unwrap();
        scan(&config, &root.path().join("base")).await.unwrap();

        std::fs::write(root.path().join("base").join("module.toml"), "# eval(payload)\n").unwrap();
        assert!(scan(&config, &root.path().join("base")).await.is_err());
    }
}
