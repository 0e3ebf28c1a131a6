//! The capability surface handed to plugin modules.
//!
//! Modules never touch the host directly. Everything they may do (logging,
//! reading the clock, sleeping, file access inside their own directory,
//! network authorization) goes through a [`ModuleContext`]. A context bound
//! to a sandbox checks each request against the sandbox policy and records
//! violations and usage on that sandbox.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::SandboxInstance;
use super::usage::{SecurityViolation, Severity, ViolationKind};
use crate::module::ModuleError;
use crate::plugin::PluginId;
use crate::version::Version;

/// Log level for [`ModuleContext::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something odd.
    Warn,
    /// Something failed.
    Error,
}

#[derive(Clone)]
struct Confinement {
    sandbox: Arc<SandboxInstance>,
    operation: Option<String>,
}

/// Capabilities available to a plugin module.
#[derive(Clone)]
pub struct ModuleContext {
    plugin_id: PluginId,
    root: PathBuf,
    config: Arc<serde_json::Value>,
    host_version: Version,
    confinement: Option<Confinement>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("plugin_id", &self.plugin_id)
            .field("root", &self.root)
            .field("sandboxed", &self.is_sandboxed())
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    /// A context with no sandbox attached, scoped to `root`.
    #[must_use]
    pub fn unrestricted(plugin_id: PluginId, root: PathBuf, host_version: Version) -> Self {
        Self {
            plugin_id,
            root,
            config: Arc::new(serde_json::Value::Object(serde_json::Map::new())),
            host_version,
            confinement: None,
        }
    }

    /// Attach the plugin's merged configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// A copy of this context bound to `sandbox` while running `operation`.
    #[must_use]
    pub(crate) fn confined(&self, sandbox: Arc<SandboxInstance>, operation: Option<&str>) -> Self {
        Self {
            confinement: Some(Confinement {
                sandbox,
                operation: operation.map(ToString::to_string),
            }),
            ..self.clone()
        }
    }

    /// The plugin this context belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// The plugin's directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The plugin's merged configuration (read-only).
    #[must_use]
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// The host version the plugin runs under.
    #[must_use]
    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Whether calls through this context are policy-checked.
    #[must_use]
    pub fn is_sandboxed(&self) -> bool {
        self.confinement.is_some()
    }

    /// Emit a log line attributed to the plugin.
    pub fn log(&self, level: LogLevel, message: &str) {
        let plugin_id = self.plugin_id.as_str();
        match level {
            LogLevel::Debug => debug!(plugin_id, "{message}"),
            LogLevel::Info => info!(plugin_id, "{message}"),
            LogLevel::Warn => warn!(plugin_id, "{message}"),
            LogLevel::Error => error!(plugin_id, "{message}"),
        }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Suspend for `duration`. Counts against the call timeout.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Read a UTF-8 file relative to the plugin directory.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Denied`] if the path escapes the plugin
    /// directory or the policy does not grant it, or an I/O error.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<String, ModuleError> {
        let full = self.check_path(path.as_ref())?;
        Ok(tokio::fs::read_to_string(full).await?)
    }

    /// Write a file relative to the plugin directory, creating parents.
    ///
    /// Written bytes count against the sandbox disk limit.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Denied`] if the path escapes the plugin
    /// directory or the policy does not grant it, or an I/O error.
    pub async fn write_file(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<(), ModuleError> {
        let full = self.check_path(path.as_ref())?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, contents).await?;
        if let Some(c) = &self.confinement {
            let bytes = u64::try_from(contents.len()).unwrap_or(u64::MAX);
            c.sandbox.with_usage(|usage| usage.add_disk(bytes));
        }
        Ok(())
    }

    /// Ask permission to contact `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::Denied`] when network access or the host is
    /// not granted.
    pub fn authorize_network(&self, host: &str) -> Result<(), ModuleError> {
        let Some(c) = &self.confinement else {
            return Ok(());
        };
        if c.sandbox.policy().allows_host(host) {
            return Ok(());
        }
        let reason = if c.sandbox.policy().network_access {
            format!("host '{host}' is not in the allowed domains")
        } else {
            format!("network access is not granted (requested '{host}')")
        };
        Err(self.deny(ViolationKind::UnauthorizedAccess, Severity::High, reason))
    }

    /// Account for `bytes` of network traffic.
    pub fn record_network(&self, bytes: u64) {
        if let Some(c) = &self.confinement {
            c.sandbox.with_usage(|usage| usage.add_network(bytes));
        }
    }

    fn check_path(&self, path: &Path) -> Result<PathBuf, ModuleError> {
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {},
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(self.deny(
                        ViolationKind::Escape,
                        Severity::Critical,
                        format!("path '{}' escapes the plugin directory", path.display()),
                    ));
                },
            }
        }

        if let Some(c) = &self.confinement {
            let policy = c.sandbox.policy();
            if !policy.filesystem_access {
                return Err(self.deny(
                    ViolationKind::UnauthorizedAccess,
                    Severity::High,
                    format!("filesystem access is not granted (requested '{}')", path.display()),
                ));
            }
            if !policy.allowed_paths.is_empty()
                && !policy.allowed_paths.iter().any(|p| relative.starts_with(p))
            {
                return Err(self.deny(
                    ViolationKind::UnauthorizedAccess,
                    Severity::High,
                    format!("path '{}' is outside the allowed paths", path.display()),
                ));
            }
        }
        Ok(self.root.join(relative))
    }

    fn deny(&self, kind: ViolationKind, severity: Severity, reason: String) -> ModuleError {
        match &self.confinement {
            Some(c) => {
                warn!(
                    plugin_id = %self.plugin_id,
                    sandbox_id = %c.sandbox.id(),
                    kind = %kind,
                    "{reason}"
                );
                c.sandbox.record_violation(SecurityViolation::new(
                    kind,
                    severity,
                    reason.clone(),
                    c.operation.as_deref(),
                ));
            },
            None => warn!(plugin_id = %self.plugin_id, kind = %kind, "{reason}"),
        }
        ModuleError::Denied(reason)
    }
}
