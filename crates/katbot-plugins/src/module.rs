//! Plugin module trait and built-in module kinds.
//!
//! A [`PluginModule`] is the code behind a plugin. Modules are either native
//! Rust types registered in a [`ModuleCatalog`] under their manifest entry
//! name, or a [`DeclarativeModule`] read from a `.toml` entry file.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::manifest::PluginManifest;
use crate::plugin::PluginId;
use crate::sandbox::ModuleContext;

/// Errors raised by plugin code.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// The module does not serve the command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A capability request was refused.
    #[error("permission denied: {0}")]
    Denied(String),
    /// Parameters did not have the expected shape.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    /// Any other failure.
    #[error("{0}")]
    Failed(String),
    /// I/O through the context failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Code behind a plugin.
///
/// Every hook except [`execute`](Self::execute) is optional. Hooks take
/// `&self`; modules that keep state use interior mutability.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Called once after the module is instantiated.
    async fn on_load(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called before the plugin starts serving commands.
    async fn on_enable(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called before the plugin stops serving commands.
    async fn on_disable(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called before the module is dropped.
    async fn on_unload(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called after the plugin's configuration changes.
    async fn on_config_change(
        &self,
        _ctx: &ModuleContext,
        _config: &Value,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Handle a message from another plugin. `Ok(None)` means no reply.
    async fn on_message(
        &self,
        _ctx: &ModuleContext,
        _from: &PluginId,
        _payload: Value,
    ) -> Result<Option<Value>, ModuleError> {
        Ok(None)
    }

    /// Custom health probe. `None` means the module has no probe.
    async fn health_probe(&self, _ctx: &ModuleContext) -> Option<Result<(), ModuleError>> {
        None
    }

    /// Run a command.
    async fn execute(
        &self,
        ctx: &ModuleContext,
        command: &str,
        params: Value,
    ) -> Result<Value, ModuleError>;
}

/// Constructor for a native module.
pub type ModuleFactory =
    Arc<dyn Fn(&PluginManifest) -> Result<Arc<dyn PluginModule>, ModuleError> + Send + Sync>;

/// Native module constructors keyed by manifest entry name.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    factories: HashMap<String, ModuleFactory>,
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&String> = self.factories.keys().collect();
        entries.sort();
        f.debug_struct("ModuleCatalog").field("entries", &entries).finish()
    }
}

impl ModuleCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `entry`, replacing any previous one.
    pub fn register<F>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest) -> Result<Arc<dyn PluginModule>, ModuleError> + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginManifest) -> Result<Arc<dyn PluginModule>, ModuleError> + Send + Sync + 'static,
    {
        self.register(entry, factory);
        self
    }

    /// Constructor registered for `entry`.
    #[must_use]
    pub fn get(&self, entry: &str) -> Option<&ModuleFactory> {
        self.factories.get(entry)
    }

    /// Whether a constructor is registered for `entry`.
    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DeclarativeCommand {
    reply: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DeclarativeHealth {
    healthy: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct DeclarativeFile {
    #[serde(default)]
    commands: BTreeMap<String, DeclarativeCommand>,
    #[serde(default)]
    health: Option<DeclarativeHealth>,
}

/// A module described entirely in TOML.
///
/// ```toml
/// [commands.greet]
/// reply = "Hello, {name}!"
///
/// [health]
/// healthy = true
/// ```
///
/// `{key}` placeholders are filled from the command's parameter object;
/// unknown placeholders are left as written.
#[derive(Debug, Clone)]
pub struct DeclarativeModule {
    commands: BTreeMap<String, String>,
    healthy: Option<bool>,
}

impl DeclarativeModule {
    /// Parse a declarative module definition.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Failed`] if the TOML is malformed.
    pub fn parse(source: &str) -> Result<Self, ModuleError> {
        let file: DeclarativeFile =
            toml::from_str(source).map_err(|e| ModuleError::Failed(format!("invalid module: {e}")))?;
        Ok(Self {
            commands: file
                .commands
                .into_iter()
                .map(|(name, cmd)| (name, cmd.reply))
                .collect(),
            healthy: file.health.map(|h| h.healthy),
        })
    }

    /// Commands this module answers.
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

fn render(template: &str, params: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let (before, after) = rest.split_at(open);
        out.push_str(before);
        let Some(close) = after.find('}') else {
            out.push_str(after);
            return out;
        };
        let key = after.get(1..close).unwrap_or_default();
        match params.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(after.get(..=close).unwrap_or_default()),
        }
        rest = after.get(close.saturating_add(1)..).unwrap_or_default();
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl PluginModule for DeclarativeModule {
    async fn health_probe(&self, _ctx: &ModuleContext) -> Option<Result<(), ModuleError>> {
        self.healthy.map(|healthy| {
            if healthy {
                Ok(())
            } else {
                Err(ModuleError::Failed("declared unhealthy".into()))
            }
        })
    }

    async fn execute(
        &self,
        _ctx: &ModuleContext,
        command: &str,
        params: Value,
    ) -> Result<Value, ModuleError> {
        let template = self
            .commands
            .get(command)
            .ok_or_else(|| ModuleError::UnknownCommand(command.to_string()))?;
        Ok(Value::String(render(template, &params)))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::version::Version;

    fn ctx() -> ModuleContext {
        ModuleContext::unrestricted(
            PluginId::from_static("greeter"),
            PathBuf::from("."),
            Version::new(1, 0, 0),
        )
    }

    #[test]
    fn test_render_placeholders() {
        let params = json!({"name": "Kat", "n": 3});
        assert_eq!(render("Hello, {name}!", &params), "Hello, Kat!");
        assert_eq!(render("{n} dice", &params), "3 dice");
        assert_eq!(render("{missing} stays", &params), "{missing} stays");
        assert_eq!(render("open { brace", &params), "open { brace");
        assert_eq!(render("no params", &Value::Null), "no params");
    }

    #[tokio::test]
    async fn test_declarative_module() {
        let module = DeclarativeModule::parse(
            r#"
            [commands.greet]
            reply = "Hello, {name}!"

            [health]
            healthy = false
            "#,
        )
        .unwrap();

        let out = module.execute(&ctx(), "greet", json!({"name": "Kat"})).await.unwrap();
        assert_eq!(out, json!("Hello, Kat!"));
        assert!(matches!(
            module.execute(&ctx(), "wave", json!({})).await,
            Err(ModuleError::UnknownCommand(_))
        ));
        assert!(matches!(module.health_probe(&ctx()).await, Some(Err(_))));
        assert_eq!(module.commands().collect::<Vec<_>>(), vec!["greet"]);
    }

    #[tokio::test]
    async fn test_declarative_without_health_has_no_probe() {
        let module = DeclarativeModule::parse("").unwrap();
        assert!(module.health_probe(&ctx()).await.is_none());
        assert!(DeclarativeModule::parse("commands = 3").is_err());
    }

    #[test]
    fn test_catalog() {
        let catalog = ModuleCatalog::new().with("greeter", |_m: &PluginManifest| {
            Ok(Arc::new(DeclarativeModule::parse("")?) as Arc<dyn PluginModule>)
        });
        assert!(catalog.contains("greeter"));
        let manifest = PluginManifest::new("g", "G", "1.0.0", "a", "greeter");
        let factory = catalog.get("greeter").unwrap();
        assert!(factory(&manifest).is_ok());
        assert!(catalog.get("other").is_none());
    }
}
