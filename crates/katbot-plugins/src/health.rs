//! Plugin health reports.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::module::PluginModule;
use crate::plugin::PluginId;
use crate::sandbox::{ModuleContext, panic_message};

/// Overall health of a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Working with reduced function. Not produced by the built-in checks.
    Degraded,
    /// At least one check failed.
    Unhealthy,
    /// Not checked yet.
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check name, e.g. `enabled`.
    pub name: String,
    /// Whether it passed.
    pub passed: bool,
    /// Why it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    /// A passing check.
    #[must_use]
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    /// A failing check.
    #[must_use]
    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: Some(message.into()),
        }
    }

    /// Pass when `ok`, otherwise fail with `message`.
    #[must_use]
    pub fn expect(name: &str, ok: bool, message: impl Into<String>) -> Self {
        if ok { Self::pass(name) } else { Self::fail(name, message) }
    }
}

/// Result of checking one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// The checked plugin.
    pub plugin_id: PluginId,
    /// Overall status.
    pub status: HealthStatus,
    /// Individual checks in evaluation order.
    pub checks: Vec<HealthCheck>,
    /// When the checks ran.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Combine checks: all passing is healthy, any failure is unhealthy and
    /// no checks at all is unknown.
    #[must_use]
    pub fn from_checks(plugin_id: PluginId, checks: Vec<HealthCheck>) -> Self {
        let status = if checks.is_empty() {
            HealthStatus::Unknown
        } else if checks.iter().all(|c| c.passed) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Self {
            plugin_id,
            status,
            checks,
            checked_at: Utc::now(),
        }
    }

    /// Failed checks.
    pub fn failures(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Run the module's custom probe under `timeout`.
///
/// Returns `None` when the module has no probe. A probe that errors, panics
/// or overruns produces a failing check.
pub async fn run_probe(
    module: &dyn PluginModule,
    ctx: &ModuleContext,
    timeout: Duration,
) -> Option<HealthCheck> {
    const NAME: &str = "probe";
    let probe = AssertUnwindSafe(module.health_probe(ctx)).catch_unwind();
    match tokio::time::timeout(timeout, probe).await {
        Err(_) => Some(HealthCheck::fail(
            NAME,
            format!("probe timed out after {}ms", timeout.as_millis()),
        )),
        Ok(Err(panic)) => Some(HealthCheck::fail(
            NAME,
            format!("probe panicked: {}", panic_message(panic.as_ref())),
        )),
        Ok(Ok(None)) => None,
        Ok(Ok(Some(Ok(())))) => Some(HealthCheck::pass(NAME)),
        Ok(Ok(Some(Err(e)))) => Some(HealthCheck::fail(NAME, e.to_string())),
    }
}
