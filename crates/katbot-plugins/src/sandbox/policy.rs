//! Sandbox policies and resource limits.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manifest::{Permission, PluginManifest};

/// Resource ceilings for one sandbox.
///
/// Usage accumulates over the sandbox's lifetime, so these are lifetime
/// budgets rather than per-call limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Bytes of parameters and results exchanged.
    pub max_memory_bytes: u64,
    /// CPU time as a percentage of sandbox lifetime.
    pub max_cpu_percent: u32,
    /// Bytes written through the context.
    pub max_disk_bytes: u64,
    /// Bytes reported through the context's network accounting.
    pub max_network_bytes: u64,
    /// Cumulative execution time in milliseconds.
    pub max_execution_time_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_cpu_percent: 100,
            max_disk_bytes: 16 * 1024 * 1024,
            max_network_bytes: 16 * 1024 * 1024,
            max_execution_time_ms: 5 * 60 * 1000,
        }
    }
}

impl ResourceLimits {
    /// Cumulative execution time budget.
    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }
}

/// What a sandboxed plugin may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Operations that may be executed. Anything else is refused.
    pub allowed_operations: BTreeSet<String>,
    /// Lifetime resource ceilings.
    pub limits: ResourceLimits,
    /// Whether network access may be authorized at all.
    pub network_access: bool,
    /// Hosts that may be contacted; empty means any host.
    pub allowed_domains: Vec<String>,
    /// Whether file access may be granted at all.
    pub filesystem_access: bool,
    /// Paths, relative to the plugin directory, that may be accessed; empty
    /// means the whole plugin directory.
    pub allowed_paths: Vec<PathBuf>,
    /// Wall-clock budget for a single call.
    pub timeout: Duration,
    /// Terminate the sandbox after this many resource-limit violations.
    pub max_resource_violations: Option<u32>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_operations: BTreeSet::new(),
            limits: ResourceLimits::default(),
            network_access: false,
            allowed_domains: Vec::new(),
            filesystem_access: false,
            allowed_paths: Vec::new(),
            timeout: Duration::from_secs(5),
            max_resource_violations: None,
        }
    }
}

impl SandboxPolicy {
    /// Derive a policy from a manifest's commands and permissions.
    ///
    /// Declared commands become the allowlist. `network[:domain]` and
    /// `filesystem[:path]` permissions switch on the matching capability,
    /// narrowed to the scopes given.
    #[must_use]
    pub fn from_manifest(
        manifest: &PluginManifest,
        limits: ResourceLimits,
        timeout: Duration,
        max_resource_violations: Option<u32>,
    ) -> Self {
        let mut policy = Self {
            allowed_operations: manifest.commands.iter().cloned().collect(),
            limits,
            timeout,
            max_resource_violations,
            ..Self::default()
        };

        for permission in manifest.parsed_permissions() {
            match permission {
                Permission::Network(scope) => {
                    policy.network_access = true;
                    policy.allowed_domains.extend(scope);
                },
                Permission::Filesystem(scope) => {
                    policy.filesystem_access = true;
                    policy.allowed_paths.extend(scope.map(PathBuf::from));
                },
            }
        }
        policy
    }

    /// Allow an additional operation.
    #[must_use]
    pub fn allow_operation(mut self, operation: impl Into<String>) -> Self {
        self.allowed_operations.insert(operation.into());
        self
    }

    /// Whether `operation` is in the allowlist.
    #[must_use]
    pub fn allows_operation(&self, operation: &str) -> bool {
        self.allowed_operations.contains(operation)
    }

    /// Whether `host` may be contacted, matching exact names and subdomains.
    #[must_use]
    pub fn allows_host(&self, host: &str) -> bool {
        if !self.network_access {
            return false;
        }
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_domains.iter().any(|domain| {
            let domain = domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}
