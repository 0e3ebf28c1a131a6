//! Plugin system configuration.
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! plugin_dir = "plugins"
//! host_version = "1.4.0"
//! health_check_interval_secs = 30
//!
//! [hot_reload]
//! enabled = true
//! debounce_ms = 500
//!
//! [sandbox]
//! enabled_by_default = true
//! timeout_ms = 5000
//! max_resource_violations = 10
//!
//! [sandbox.limits]
//! max_memory_bytes = 67108864
//!
//! [plugins.dice]
//! enabled = true
//! sides = 20
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;
use crate::sandbox::ResourceLimits;
use crate::version::{Version, parse_version};

/// Config key that controls whether a plugin is enabled on load.
pub const ENABLED_KEY: &str = "enabled";
/// Config key that controls whether a plugin runs in a sandbox.
pub const SANDBOXED_KEY: &str = "sandboxed";

/// Upper bound for millisecond settings.
const MAX_MILLIS: u64 = 10 * 60 * 1000;

/// Top-level plugin system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginSystemConfig {
    /// Directory scanned for plugin bundles.
    pub plugin_dir: PathBuf,
    /// Host version reported to plugins and checked against their bounds.
    pub host_version: String,
    /// Seconds between health ticks.
    pub health_check_interval_secs: u64,
    /// Budget for one custom health probe.
    pub health_probe_timeout_ms: u64,
    /// Hot reload settings.
    pub hot_reload: HotReloadConfig,
    /// Sandbox defaults.
    pub sandbox: SandboxConfig,
    /// Load-time security scan settings.
    pub security: SecurityConfig,
    /// Per-plugin configuration overrides keyed by plugin id.
    pub plugins: BTreeMap<String, Value>,
}

impl Default for PluginSystemConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            health_check_interval_secs: 30,
            health_probe_timeout_ms: 5_000,
            hot_reload: HotReloadConfig::default(),
            sandbox: SandboxConfig::default(),
            security: SecurityConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

/// `[hot_reload]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HotReloadConfig {
    /// Watch plugin sources after loading.
    pub enabled: bool,
    /// Quiet period after the last change before reloading.
    pub debounce_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: 500,
        }
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Default for the per-plugin `sandboxed` key.
    pub enabled_by_default: bool,
    /// Per-call timeout.
    pub timeout_ms: u64,
    /// Lifetime resource ceilings.
    pub limits: ResourceLimits,
    /// Resource-limit violations after which a sandbox is terminated.
    pub max_resource_violations: Option<u32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled_by_default: true,
            timeout_ms: 5_000,
            limits: ResourceLimits::default(),
            max_resource_violations: None,
        }
    }
}

/// `[security]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Refuse to load plugins with critical or high scan findings.
    pub block_high_severity: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            block_high_severity: true,
        }
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> PluginError {
    PluginError::Config {
        field: field.into(),
        message: message.into(),
    }
}

impl PluginSystemConfig {
    /// Read and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(path.display().to_string(), format!("failed to read: {e}")))?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), plugins = config.plugins.len(), "Loaded plugin system config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] on parse or validation failure.
    pub fn from_toml_str(content: &str) -> PluginResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| invalid("<root>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every field.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] naming the first invalid field.
    pub fn validate(&self) -> PluginResult<()> {
        parse_version(&self.host_version).map_err(|e| invalid("host_version", e))?;

        if self.health_check_interval_secs == 0 {
            return Err(invalid("health_check_interval_secs", "must be at least 1"));
        }
        if !(1..=MAX_MILLIS).contains(&self.health_probe_timeout_ms) {
            return Err(invalid(
                "health_probe_timeout_ms",
                format!("must be between 1 and {MAX_MILLIS}"),
            ));
        }
        if self.hot_reload.debounce_ms > MAX_MILLIS {
            return Err(invalid(
                "hot_reload.debounce_ms",
                format!("must be at most {MAX_MILLIS}"),
            ));
        }
        if !(1..=MAX_MILLIS).contains(&self.sandbox.timeout_ms) {
            return Err(invalid(
                "sandbox.timeout_ms",
                format!("must be between 1 and {MAX_MILLIS}"),
            ));
        }
        if !(1..=100).contains(&self.sandbox.limits.max_cpu_percent) {
            return Err(invalid(
                "sandbox.limits.max_cpu_percent",
                "must be between 1 and 100",
            ));
        }
        if self.sandbox.max_resource_violations == Some(0) {
            return Err(invalid(
                "sandbox.max_resource_violations",
                "must be at least 1 when set",
            ));
        }
        for (id, overrides) in &self.plugins {
            if !PluginId::is_valid_id(id) {
                return Err(invalid(format!("plugins.{id}"), "invalid plugin id"));
            }
            if !overrides.is_object() {
                return Err(invalid(format!("plugins.{id}"), "must be a table"));
            }
        }
        Ok(())
    }

    /// The configured host version.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if it does not parse.
    pub fn host_version(&self) -> PluginResult<Version> {
        parse_version(&self.host_version).map_err(|e| invalid("host_version", e))
    }

    /// Interval between health ticks.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Budget for one custom health probe.
    #[must_use]
    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    /// Hot reload quiet period.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.hot_reload.debounce_ms)
    }

    /// Per-call sandbox timeout.
    #[must_use]
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox.timeout_ms)
    }

    /// Overrides configured for `id`.
    #[must_use]
    pub fn overrides_for(&self, id: &PluginId) -> Option<&Value> {
        self.plugins.get(id.as_str())
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// A plugin's effective configuration: manifest defaults, then overrides,
/// then the well-known keys filled in where still absent.
#[must_use]
pub fn merge_plugin_config(
    defaults: &Map<String, Value>,
    overrides: Option<&Value>,
    sandboxed_by_default: bool,
) -> Value {
    let mut merged = Value::Object(defaults.clone());
    if let Some(overrides) = overrides {
        deep_merge(&mut merged, overrides);
    }
    if let Value::Object(map) = &mut merged {
        map.entry(ENABLED_KEY).or_insert(Value::Bool(true));
        map.entry(SANDBOXED_KEY)
            .or_insert(Value::Bool(sandboxed_by_default));
    }
    merged
}

/// Read a boolean key, falling back to `default` when absent or not a bool.
#[must_use]
pub fn config_flag(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}
