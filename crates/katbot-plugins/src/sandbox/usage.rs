//! Resource accounting and security violations.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::ResourceLimits;

/// Resources consumed by a sandbox since creation.
///
/// Every counter only grows; usage is discarded only when the sandbox is
/// destroyed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Bytes of parameters and results exchanged.
    pub memory_bytes: u64,
    /// Time spent inside module calls.
    pub cpu_time: Duration,
    /// Bytes written through the context.
    pub disk_bytes: u64,
    /// Bytes reported through network accounting.
    pub network_bytes: u64,
    /// Calls that reached the module.
    pub executions: u64,
}

impl ResourceUsage {
    pub(crate) fn add_memory(&mut self, bytes: u64) {
        self.memory_bytes = self.memory_bytes.saturating_add(bytes);
    }

    pub(crate) fn add_cpu_time(&mut self, elapsed: Duration) {
        self.cpu_time = self.cpu_time.saturating_add(elapsed);
    }

    pub(crate) fn add_disk(&mut self, bytes: u64) {
        self.disk_bytes = self.disk_bytes.saturating_add(bytes);
    }

    pub(crate) fn add_network(&mut self, bytes: u64) {
        self.network_bytes = self.network_bytes.saturating_add(bytes);
    }

    pub(crate) fn add_execution(&mut self) {
        self.executions = self.executions.saturating_add(1);
    }

    /// CPU time as a percentage of `lifetime`, or `None` during the first
    /// second when the ratio is meaningless.
    #[must_use]
    pub fn cpu_percent(&self, lifetime: Duration) -> Option<u128> {
        let life_ms = lifetime.as_millis();
        if life_ms < 1000 {
            return None;
        }
        self.cpu_time
            .as_millis()
            .saturating_mul(100)
            .checked_div(life_ms)
    }

    /// Describe every limit this usage exceeds.
    #[must_use]
    pub fn exceeded(&self, limits: &ResourceLimits, lifetime: Duration) -> Vec<String> {
        let mut exceeded = Vec::new();
        if self.memory_bytes > limits.max_memory_bytes {
            exceeded.push(format!(
                "memory {} bytes exceeds limit {}",
                self.memory_bytes, limits.max_memory_bytes
            ));
        }
        if self.disk_bytes > limits.max_disk_bytes {
            exceeded.push(format!(
                "disk {} bytes exceeds limit {}",
                self.disk_bytes, limits.max_disk_bytes
            ));
        }
        if self.network_bytes > limits.max_network_bytes {
            exceeded.push(format!(
                "network {} bytes exceeds limit {}",
                self.network_bytes, limits.max_network_bytes
            ));
        }
        if self.cpu_time > limits.max_execution_time() {
            exceeded.push(format!(
                "execution time {}ms exceeds limit {}ms",
                self.cpu_time.as_millis(),
                limits.max_execution_time_ms
            ));
        }
        if let Some(percent) = self.cpu_percent(lifetime) {
            if percent > u128::from(limits.max_cpu_percent) {
                exceeded.push(format!(
                    "cpu {percent}% exceeds limit {}%",
                    limits.max_cpu_percent
                ));
            }
        }
        exceeded
    }
}

/// Category of a security violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// Attempt to reach outside the sandbox.
    Escape,
    /// A resource ceiling was exceeded.
    ResourceLimit,
    /// Use of an operation or capability that was not granted.
    UnauthorizedAccess,
    /// Code or input recognised as malicious.
    MaliciousCode,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Escape => "escape",
            Self::ResourceLimit => "resource-limit",
            Self::UnauthorizedAccess => "unauthorized-access",
            Self::MaliciousCode => "malicious-code",
        })
    }
}

/// How serious a finding is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a warning.
    Medium,
    /// Blocks loading.
    High,
    /// Blocks loading and aborts calls.
    Critical,
}

impl Severity {
    /// Whether this severity blocks a plugin from loading.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        self >= Self::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// A recorded violation. Append-only per sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Category.
    pub kind: ViolationKind,
    /// Severity.
    pub severity: Severity,
    /// What happened.
    pub description: String,
    /// The operation being executed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

impl SecurityViolation {
    /// Create a violation stamped with the current time.
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        description: impl Into<String>,
        operation: Option<&str>,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            operation: operation.map(ToString::to_string),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_needs_a_second_of_lifetime() {
        let usage = ResourceUsage {
            cpu_time: Duration::from_millis(900),
            ..ResourceUsage::default()
        };
        assert_eq!(usage.cpu_percent(Duration::from_millis(900)), None);
        assert_eq!(usage.cpu_percent(Duration::from_secs(3)), Some(30));
    }

    #[test]
    fn test_exceeded_limits() {
        let limits = ResourceLimits {
            max_memory_bytes: 10,
            max_cpu_percent: 50,
            max_disk_bytes: 10,
            max_network_bytes: 10,
            max_execution_time_ms: 1000,
        };
        let mut usage = ResourceUsage::default();
        assert!(usage.exceeded(&limits, Duration::from_secs(10)).is_empty());

        usage.add_memory(11);
        usage.add_network(5);
        usage.add_cpu_time(Duration::from_millis(1500));
        let exceeded = usage.exceeded(&limits, Duration::from_secs(2));
        assert_eq!(exceeded.len(), 3, "{exceeded:?}");
        assert!(exceeded.iter().any(|e| e.starts_with("memory")));
        assert!(exceeded.iter().any(|e| e.starts_with("execution time")));
        assert!(exceeded.iter().any(|e| e.starts_with("cpu 75%")));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical.is_blocking());
        assert!(Severity::High.is_blocking());
        assert!(!Severity::Medium.is_blocking());
        assert!(Severity::Low < Severity::Medium);
        assert_eq!(
            serde_json::to_string(&ViolationKind::UnauthorizedAccess).unwrap(),
            "\"unauthorized-access\""
        );
    }
}
