//! Per-plugin isolated execution.
//!
//! A sandbox wraps calls into a plugin module with a policy: an operation
//! allowlist, a scan of the call parameters for escape markers, a wall-clock
//! timeout and lifetime resource accounting. Violations are appended to the
//! sandbox and never cleared; usage only grows until the sandbox is
//! destroyed.
//!
//! This is a policy layer over in-process modules, not a security boundary
//! for hostile native code.

pub mod context;
pub mod policy;
pub mod usage;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use context::{LogLevel, ModuleContext};
pub use policy::{ResourceLimits, SandboxPolicy};
pub use usage::{ResourceUsage, SecurityViolation, Severity, ViolationKind};

use crate::error::{PluginError, PluginResult};
use crate::module::PluginModule;
use crate::plugin::PluginId;

/// Substrings in serialized parameters that abort a call.
pub const DANGEROUS_MARKERS: &[&str] = &[
    "__proto__",
    "constructor.prototype",
    "../",
    "..\\",
    "process.",
    "require(",
    "child_process",
    "eval(",
    "Function(",
    "globalThis",
];

/// Unique sandbox handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sandbox execution state, supervised independently of the plugin lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Ready for a call.
    Idle,
    /// A call is in flight.
    Executing,
    /// Refuses all further calls.
    Terminated,
}

struct SandboxInner {
    usage: ResourceUsage,
    violations: Vec<SecurityViolation>,
    state: SandboxState,
    last_used: DateTime<Utc>,
}

/// One plugin's sandbox.
pub struct SandboxInstance {
    id: SandboxId,
    plugin_id: PluginId,
    created_at: DateTime<Utc>,
    started: Instant,
    policy: SandboxPolicy,
    inner: Mutex<SandboxInner>,
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SandboxInstance {
    fn new(plugin_id: PluginId, policy: SandboxPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: SandboxId::new(),
            plugin_id,
            created_at: now,
            started: Instant::now(),
            policy,
            inner: Mutex::new(SandboxInner {
                usage: ResourceUsage::default(),
                violations: Vec::new(),
                state: SandboxState::Idle,
                last_used: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SandboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sandbox id.
    #[must_use]
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// The sandboxed plugin.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// The policy enforced on every call.
    #[must_use]
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// When the sandbox was created.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since creation.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.started.elapsed()
    }

    /// When the sandbox last received a call.
    #[must_use]
    pub fn last_used(&self) -> DateTime<Utc> {
        self.lock().last_used
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.lock().state
    }

    /// Snapshot of accumulated usage.
    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        self.lock().usage.clone()
    }

    /// Every violation recorded so far, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<SecurityViolation> {
        self.lock().violations.clone()
    }

    /// Whether usage is within every limit and the sandbox still accepts calls.
    #[must_use]
    pub fn is_within_limits(&self) -> bool {
        let lifetime = self.lifetime();
        let inner = self.lock();
        inner.state != SandboxState::Terminated
            && inner.usage.exceeded(&self.policy.limits, lifetime).is_empty()
    }

    pub(crate) fn with_usage(&self, f: impl FnOnce(&mut ResourceUsage)) {
        f(&mut self.lock().usage);
    }

    pub(crate) fn record_violation(&self, violation: SecurityViolation) {
        self.lock().violations.push(violation);
    }

    fn set_state(&self, state: SandboxState) {
        let mut inner = self.lock();
        if inner.state != SandboxState::Terminated {
            inner.state = state;
        }
    }

    fn touch(&self) {
        self.lock().last_used = Utc::now();
    }

    /// Add a call's usage, record limit violations and apply the
    /// termination threshold.
    fn account(&self, bytes: u64, elapsed: Duration, operation: &str) {
        let lifetime = self.lifetime();
        let mut inner = self.lock();
        inner.usage.add_memory(bytes);
        inner.usage.add_cpu_time(elapsed);
        inner.usage.add_execution();

        for description in inner.usage.exceeded(&self.policy.limits, lifetime) {
            warn!(
                plugin_id = %self.plugin_id,
                sandbox_id = %self.id,
                "Resource limit exceeded: {description}"
            );
            inner.violations.push(SecurityViolation::new(
                ViolationKind::ResourceLimit,
                Severity::Medium,
                description,
                Some(operation),
            ));
        }

        if let Some(max) = self.policy.max_resource_violations {
            let count = inner
                .violations
                .iter()
                .filter(|v| v.kind == ViolationKind::ResourceLimit)
                .count();
            if count >= usize::try_from(max).unwrap_or(usize::MAX) {
                warn!(
                    plugin_id = %self.plugin_id,
                    sandbox_id = %self.id,
                    violations = count,
                    "Terminating sandbox after repeated resource violations"
                );
                inner.state = SandboxState::Terminated;
            }
        }
    }
}

/// Result of one sandboxed call.
#[derive(Debug)]
pub struct SandboxExecution {
    /// Whether the module returned a value.
    pub success: bool,
    /// The module's return value.
    pub result: Option<serde_json::Value>,
    /// Why the call failed.
    pub error: Option<PluginError>,
    /// Wall-clock time of the call.
    pub execution_time: Duration,
    /// Usage snapshot after the call.
    pub resource_usage: ResourceUsage,
    /// Whether the parameters carried an escape marker.
    pub escape_detected: bool,
}

/// Owns every live sandbox.
#[derive(Debug, Default)]
pub struct SandboxManager {
    sandboxes: DashMap<SandboxId, Arc<SandboxInstance>>,
}

impl SandboxManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sandbox for `plugin_id`.
    pub fn create_sandbox(&self, plugin_id: PluginId, policy: SandboxPolicy) -> SandboxId {
        let sandbox = SandboxInstance::new(plugin_id, policy);
        let id = sandbox.id;
        info!(plugin_id = %sandbox.plugin_id, sandbox_id = %id, "Created sandbox");
        self.sandboxes.insert(id, Arc::new(sandbox));
        id
    }

    /// Destroy a sandbox, discarding its usage and violations.
    ///
    /// Returns `false` if no such sandbox existed.
    pub fn destroy_sandbox(&self, id: &SandboxId) -> bool {
        let removed = self.sandboxes.remove(id).is_some();
        if removed {
            info!(sandbox_id = %id, "Destroyed sandbox");
        }
        removed
    }

    /// Look up a sandbox.
    #[must_use]
    pub fn get(&self, id: &SandboxId) -> Option<Arc<SandboxInstance>> {
        self.sandboxes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    /// Whether no sandbox is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Run `operation` on `module` under the sandbox's policy.
    ///
    /// The module receives `base` confined to the sandbox. Policy failures,
    /// module errors, panics and timeouts are reported in the returned
    /// [`SandboxExecution`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Sandbox`] if the sandbox does not exist or has
    /// been terminated.
    pub async fn execute_in_sandbox(
        &self,
        sandbox_id: &SandboxId,
        module: &dyn PluginModule,
        base: &ModuleContext,
        operation: &str,
        params: serde_json::Value,
    ) -> PluginResult<SandboxExecution> {
        let sandbox = self
            .get(sandbox_id)
            .ok_or_else(|| PluginError::Sandbox(format!("unknown sandbox {sandbox_id}")))?;
        if sandbox.state() == SandboxState::Terminated {
            return Err(PluginError::Sandbox(format!(
                "sandbox {sandbox_id} has been terminated"
            )));
        }
        sandbox.touch();
        let started = Instant::now();

        if !sandbox.policy.allows_operation(operation) {
            warn!(
                plugin_id = %sandbox.plugin_id,
                sandbox_id = %sandbox_id,
                operation,
                "Operation not in allowlist"
            );
            sandbox.record_violation(SecurityViolation::new(
                ViolationKind::UnauthorizedAccess,
                Severity::High,
                format!("operation '{operation}' is not in the allowlist"),
                Some(operation),
            ));
            return Ok(failed(
                &sandbox,
                PluginError::OperationNotAllowed {
                    plugin_id: sandbox.plugin_id.clone(),
                    operation: operation.to_string(),
                },
                started.elapsed(),
                false,
            ));
        }

        let serialized = params.to_string();
        if let Some(marker) = DANGEROUS_MARKERS.iter().find(|m| serialized.contains(**m)) {
            let reason = format!("parameters contain dangerous pattern '{marker}'");
            warn!(
                plugin_id = %sandbox.plugin_id,
                sandbox_id = %sandbox_id,
                operation,
                "Sandbox escape attempt: {reason}"
            );
            sandbox.record_violation(SecurityViolation::new(
                ViolationKind::Escape,
                Severity::Critical,
                reason.clone(),
                Some(operation),
            ));
            return Ok(failed(
                &sandbox,
                PluginError::SandboxEscape {
                    operation: operation.to_string(),
                    reason,
                },
                started.elapsed(),
                true,
            ));
        }

        let param_bytes = u64::try_from(serialized.len()).unwrap_or(u64::MAX);
        let ctx = base.confined(Arc::clone(&sandbox), Some(operation));
        let timeout = sandbox.policy.timeout;

        sandbox.set_state(SandboxState::Executing);
        debug!(plugin_id = %sandbox.plugin_id, sandbox_id = %sandbox_id, operation, "Executing in sandbox");
        let call = AssertUnwindSafe(module.execute(&ctx, operation, params)).catch_unwind();
        let outcome = tokio::time::timeout(timeout, call).await;
        let elapsed = started.elapsed();

        let (result, error) = match outcome {
            Err(_) => (
                None,
                Some(PluginError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                }),
            ),
            Ok(Err(panic)) => (
                None,
                Some(PluginError::ExecutionFailed(format!(
                    "plugin panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            ),
            Ok(Ok(Err(e))) => (None, Some(PluginError::ExecutionFailed(e.to_string()))),
            Ok(Ok(Ok(value))) => (Some(value), None),
        };

        let result_bytes = result
            .as_ref()
            .map_or(0, |v| u64::try_from(v.to_string().len()).unwrap_or(u64::MAX));
        sandbox.account(param_bytes.saturating_add(result_bytes), elapsed, operation);
        sandbox.set_state(SandboxState::Idle);

        Ok(SandboxExecution {
            success: error.is_none(),
            result,
            error,
            execution_time: elapsed,
            resource_usage: sandbox.usage(),
            escape_detected: false,
        })
    }
}

fn failed(
    sandbox: &SandboxInstance,
    error: PluginError,
    execution_time: Duration,
    escape_detected: bool,
) -> SandboxExecution {
    SandboxExecution {
        success: false,
        result: None,
        error: Some(error),
        execution_time,
        resource_usage: sandbox.usage(),
        escape_detected,
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::module::ModuleError;
    use crate::version::Version;

    #[derive(Default)]
    struct Probe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginModule for Probe {
        async fn execute(
            &self,
            ctx: &ModuleContext,
            command: &str,
            params: Value,
        ) -> Result<Value, ModuleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match command {
                "echo" => Ok(params),
                "slow" => {
                    ctx.sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                },
                "boom" => panic!("kaboom"),
                "fail" => Err(ModuleError::Failed("nope".into())),
                other => Err(ModuleError::UnknownCommand(other.into())),
            }
        }
    }

    fn base() -> ModuleContext {
        ModuleContext::unrestricted(
            PluginId::from_static("probe"),
            PathBuf::from("."),
            Version::new(1, 0, 0),
        )
    }

    fn policy() -> SandboxPolicy {
        SandboxPolicy::default()
            .allow_operation("echo")
            .allow_operation("slow")
            .allow_operation("boom")
            .allow_operation("fail")
    }

    #[tokio::test]
    async fn test_disallowed_operation_never_runs() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy());
        let module = Probe::default();

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "format_disk", json!({}))
            .await
            .unwrap();
        assert!(!exec.success);
        assert!(matches!(exec.error, Some(PluginError::OperationNotAllowed { .. })));
        assert_eq!(module.calls.load(Ordering::SeqCst), 0);

        let violations = manager.get(&id).unwrap().violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::UnauthorizedAccess);
    }

    #[tokio::test]
    async fn test_escape_markers_abort_the_call() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy());
        let module = Probe::default();

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "echo", json!({"path": "../../etc/passwd"}))
            .await
            .unwrap();
        assert!(exec.escape_detected);
        assert!(matches!(exec.error, Some(PluginError::SandboxEscape { .. })));
        assert_eq!(module.calls.load(Ordering::SeqCst), 0);
        let violations = manager.get(&id).unwrap().violations();
        assert_eq!(violations[0].kind, ViolationKind::Escape);
        assert_eq!(violations[0].severity, Severity::Critical);

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "echo", json!({"k": {"__proto__": 1}}))
            .await
            .unwrap();
        assert!(exec.escape_detected);
    }

    #[tokio::test]
    async fn test_success_accumulates_usage_monotonically() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy());
        let module = Probe::default();

        let mut previous = ResourceUsage::default();
        for i in 0..3 {
            let exec = manager
                .execute_in_sandbox(&id, &module, &base(), "echo", json!({"n": i}))
                .await
                .unwrap();
            assert!(exec.success);
            assert_eq!(exec.result, Some(json!({"n": i})));
            let usage = exec.resource_usage;
            assert!(usage.memory_bytes > previous.memory_bytes);
            assert!(usage.cpu_time >= previous.cpu_time);
            assert!(usage.executions > previous.executions);
            previous = usage;
        }
        assert_eq!(previous.executions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_an_error_not_a_violation() {
        let manager = SandboxManager::new();
        let mut policy = policy();
        policy.timeout = Duration::from_millis(50);
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy);
        let module = Probe::default();

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "slow", json!({}))
            .await
            .unwrap();
        assert!(matches!(exec.error, Some(PluginError::Timeout { .. })));
        assert!(exec.resource_usage.cpu_time >= Duration::from_millis(50));
        assert!(manager.get(&id).unwrap().violations().is_empty());
        assert_eq!(manager.get(&id).unwrap().state(), SandboxState::Idle);
    }

    #[tokio::test]
    async fn test_panics_and_module_errors_are_caught() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy());
        let module = Probe::default();

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "boom", json!({}))
            .await
            .unwrap();
        match exec.error {
            Some(PluginError::ExecutionFailed(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected: {other:?}"),
        }

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "fail", json!({}))
            .await
            .unwrap();
        assert!(!exec.success);
        assert_eq!(exec.resource_usage.executions, 2);
    }

    #[tokio::test]
    async fn test_resource_violations_and_termination_threshold() {
        let manager = SandboxManager::new();
        let mut policy = policy();
        policy.limits.max_memory_bytes = 1;
        policy.max_resource_violations = Some(2);
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy);
        let module = Probe::default();

        let exec = manager
            .execute_in_sandbox(&id, &module, &base(), "echo", json!({}))
            .await
            .unwrap();
        assert!(exec.success, "limit violations are not fatal to the call");
        assert_eq!(manager.get(&id).unwrap().state(), SandboxState::Idle);

        manager
            .execute_in_sandbox(&id, &module, &base(), "echo", json!({}))
            .await
            .unwrap();
        let sandbox = manager.get(&id).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Terminated);
        assert!(!sandbox.is_within_limits());

        let err = manager
            .execute_in_sandbox(&id, &module, &base(), "echo", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_destroyed_sandboxes() {
        let manager = SandboxManager::new();
        let id = manager.create_sandbox(PluginId::from_static("probe"), policy());
        assert_eq!(manager.len(), 1);
        assert!(manager.destroy_sandbox(&id));
        assert!(!manager.destroy_sandbox(&id));
        assert!(manager.is_empty());

        let err = manager
            .execute_in_sandbox(&id, &Probe::default(), &base(), "echo", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::SandboxError);
    }
}
