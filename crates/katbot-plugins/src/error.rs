//! Plugin error types.
//!
//! Every [`PluginError`] maps to a stable, machine-readable [`ErrorCode`] so
//! callers can branch on failures without matching on display strings.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::PluginId;
use crate::plugin::PluginState;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No plugin with the requested id.
    PluginNotFound,
    /// A plugin with the id is already loaded.
    PluginAlreadyLoaded,
    /// Missing or conflicting dependencies.
    DependencyResolutionFailed,
    /// Sandbox creation, lookup or state failure.
    SandboxError,
    /// The operation is not in the sandbox allowlist.
    OperationNotAllowed,
    /// Parameters or behaviour tried to escape the sandbox.
    SandboxEscape,
    /// Execution exceeded its wall-clock budget.
    Timeout,
    /// The module could not be read or instantiated.
    ModuleLoadError,
    /// The manifest failed validation.
    ValidationError,
    /// The on-load security scan blocked the plugin.
    SecurityScanFailed,
    /// The requested lifecycle transition is not valid from the current state.
    InvalidState,
    /// The host version is outside the plugin's declared bounds.
    IncompatibleHost,
    /// Registry bookkeeping failure (dependents, cycles, persistence).
    RegistryError,
    /// Plugin code failed while executing.
    ExecutionFailed,
    /// Configuration could not be loaded or is invalid.
    ConfigError,
    /// The capability is declared but not implemented.
    NotImplemented,
    /// Underlying I/O failure.
    IoError,
}

impl ErrorCode {
    /// The wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::PluginAlreadyLoaded => "PLUGIN_ALREADY_LOADED",
            Self::DependencyResolutionFailed => "DEPENDENCY_RESOLUTION_FAILED",
            Self::SandboxError => "SANDBOX_ERROR",
            Self::OperationNotAllowed => "OPERATION_NOT_ALLOWED",
            Self::SandboxEscape => "SANDBOX_ESCAPE",
            Self::Timeout => "TIMEOUT",
            Self::ModuleLoadError => "MODULE_LOAD_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::SecurityScanFailed => "SECURITY_SCAN_FAILED",
            Self::InvalidState => "INVALID_STATE",
            Self::IncompatibleHost => "INCOMPATIBLE_HOST",
            Self::RegistryError => "REGISTRY_ERROR",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::IoError => "IO_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The requested plugin was not found.
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// A plugin with this ID is already loaded.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(PluginId),

    /// The plugin ID is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// The manifest failed validation.
    #[error("manifest validation failed: {}", errors.join("; "))]
    Validation {
        /// Every validation error found.
        errors: Vec<String>,
    },

    /// Failed to parse a plugin manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParseError {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// Dependency resolution reported missing or conflicting dependencies.
    #[error("dependency resolution failed for {plugin_id}: missing [{}], conflicts [{}]", missing.join(", "), conflicts.join("; "))]
    DependencyResolution {
        /// The plugin being resolved.
        plugin_id: PluginId,
        /// Required dependencies that are not known.
        missing: Vec<String>,
        /// Version mismatches and cycles.
        conflicts: Vec<String>,
    },

    /// A dependency cycle was found while walking the registry graph.
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency {
        /// The ids forming the cycle, first id repeated at the end.
        path: Vec<String>,
    },

    /// The plugin still has registered dependents.
    #[error("plugin {plugin_id} is required by: {}", dependents.join(", "))]
    HasDependents {
        /// The plugin that was asked to leave.
        plugin_id: PluginId,
        /// Plugins listing it as a non-optional dependency.
        dependents: Vec<String>,
    },

    /// The host version is outside the plugin's declared bounds.
    #[error("plugin {plugin_id} is incompatible with host {host_version}: {reason}")]
    IncompatibleHost {
        /// The plugin being checked.
        plugin_id: PluginId,
        /// The host version that was checked.
        host_version: String,
        /// Which bound failed.
        reason: String,
    },

    /// The on-load security scan found blocking issues.
    #[error("security scan blocked {plugin_id}: {}", findings.join("; "))]
    SecurityScan {
        /// The scanned plugin.
        plugin_id: PluginId,
        /// Descriptions of the blocking findings.
        findings: Vec<String>,
    },

    /// Plugin module failed to load.
    #[error("module load failed: {plugin_id} - {message}")]
    ModuleLoad {
        /// The plugin that failed to load.
        plugin_id: PluginId,
        /// Failure reason.
        message: String,
    },

    /// The source type has no implemented loading strategy.
    #[error("{0} is not implemented")]
    NotImplemented(String),

    /// A lifecycle transition was requested from the wrong state.
    #[error("plugin {plugin_id} cannot {operation} while {state}")]
    InvalidState {
        /// The plugin.
        plugin_id: PluginId,
        /// The current state.
        state: PluginState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// Sandbox lookup, creation or state failure.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// The operation is not in the sandbox allowlist.
    #[error("operation '{operation}' is not allowed for plugin {plugin_id}")]
    OperationNotAllowed {
        /// The sandboxed plugin.
        plugin_id: PluginId,
        /// The rejected operation.
        operation: String,
    },

    /// A sandbox escape attempt was detected.
    #[error("sandbox escape detected in '{operation}': {reason}")]
    SandboxEscape {
        /// The operation being executed.
        operation: String,
        /// What tripped the detector.
        reason: String,
    },

    /// Execution exceeded its wall-clock budget.
    #[error("operation '{operation}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The operation being executed.
        operation: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Plugin code failed while executing.
    #[error("plugin execution failed: {0}")]
    ExecutionFailed(String),

    /// Registry bookkeeping failure.
    #[error("registry error: {0}")]
    Registry(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error in {field}: {message}")]
    Config {
        /// The offending field (dotted path).
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// The machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::PluginNotFound,
            Self::AlreadyLoaded(_) => ErrorCode::PluginAlreadyLoaded,
            Self::InvalidId(_) | Self::Validation { .. } | Self::ManifestParseError { .. } => {
                ErrorCode::ValidationError
            },
            Self::DependencyResolution { .. } => ErrorCode::DependencyResolutionFailed,
            Self::CircularDependency { .. } | Self::HasDependents { .. } | Self::Registry(_) => {
                ErrorCode::RegistryError
            },
            Self::IncompatibleHost { .. } => ErrorCode::IncompatibleHost,
            Self::SecurityScan { .. } => ErrorCode::SecurityScanFailed,
            Self::ModuleLoad { .. } => ErrorCode::ModuleLoadError,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::Sandbox(_) => ErrorCode::SandboxError,
            Self::OperationNotAllowed { .. } => ErrorCode::OperationNotAllowed,
            Self::SandboxEscape { .. } => ErrorCode::SandboxEscape,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            Self::Config { .. } => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
        }
    }

    /// Whether the caller can fix the input and retry.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.code() == ErrorCode::ValidationError
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_names() {
        let err = PluginError::NotFound(PluginId::from_static("ghost"));
        assert_eq!(err.code().as_str(), "PLUGIN_NOT_FOUND");

        let err = PluginError::Timeout {
            operation: "slow".into(),
            timeout: Duration::from_millis(10),
        };
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.to_string(), "operation 'slow' timed out after 10ms");
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::SandboxEscape).unwrap();
        assert_eq!(json, "\"SANDBOX_ESCAPE\"");
        let json = serde_json::to_string(&ErrorCode::DependencyResolutionFailed).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCode::DependencyResolutionFailed));
    }

    #[test]
    fn validation_errors_are_recoverable() {
        let err = PluginError::Validation {
            errors: vec!["name is required".into(), "author is required".into()],
        };
        assert!(err.is_validation());
        assert_eq!(
            err.to_string(),
            "manifest validation failed: name is required; author is required"
        );
    }

    #[test]
    fn circular_dependency_display() {
        let err = PluginError::CircularDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency: a -> b -> a");
    }
}
