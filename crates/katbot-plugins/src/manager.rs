//! Plugin manager.
//!
//! Owns every live plugin instance and drives it through the lifecycle
//! state machine (see [`PluginState`]). Transitions for one plugin id are
//! serialized behind a per-id async mutex; different ids proceed
//! concurrently. Module hooks are awaited without holding the instance
//! table lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock as AsyncRwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ENABLED_KEY, PluginSystemConfig, SANDBOXED_KEY, config_flag, deep_merge, merge_plugin_config};
use crate::error::{PluginError, PluginResult};
use crate::events::{PluginEvent, PluginEventBus, PluginEventKind};
use crate::health::{HealthCheck, HealthReport, HealthStatus, run_probe};
use crate::loader::{PluginLoader, SourceType};
use crate::manifest::PluginManifest;
use crate::metrics::PluginMetrics;
use crate::module::{ModuleCatalog, ModuleError, PluginModule};
use crate::plugin::{PluginId, PluginState};
use crate::registry::PluginRegistry;
use crate::resolver::DependencyResolver;
use crate::sandbox::{ModuleContext, SandboxId, SandboxInstance, SandboxManager, SandboxPolicy, panic_message};
use crate::storage::{FsStorage, PluginStorage};
use crate::version::{StaticHostVersion, Version};

/// Manager-owned state for one plugin.
struct PluginInstance {
    manifest: PluginManifest,
    module: Arc<dyn PluginModule>,
    state: PluginState,
    health: HealthStatus,
    loaded_at: DateTime<Utc>,
    last_error: Option<String>,
    config: Value,
    sandbox_id: Option<SandboxId>,
    metrics: PluginMetrics,
    source: String,
    source_type: SourceType,
    dir: PathBuf,
}

/// What a reload needs to bring a plugin back: source, source type and
/// effective configuration.
#[cfg(feature = "watch")]
type ReloadSnapshot = (String, SourceType, Value);

#[cfg(feature = "watch")]
fn reload_snapshot(instance: &PluginInstance) -> ReloadSnapshot {
    (
        instance.source.clone(),
        instance.source_type,
        instance.config.clone(),
    )
}

/// Whether a release also drops the registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Unload,
    Reload,
}

/// Read-only snapshot of a managed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin id.
    pub id: PluginId,
    /// Display name.
    pub name: String,
    /// Loaded version.
    pub version: String,
    /// Lifecycle state.
    pub state: PluginState,
    /// Last computed health.
    pub health: HealthStatus,
    /// Whether the plugin serves commands.
    pub enabled: bool,
    /// When the module was loaded.
    pub loaded_at: DateTime<Utc>,
    /// Last lifecycle failure.
    pub last_error: Option<String>,
    /// Effective configuration.
    pub config: Value,
    /// Whether commands run in a sandbox.
    pub sandboxed: bool,
    /// Execution counters.
    pub metrics: PluginMetrics,
    /// Where it was loaded from.
    pub source: String,
}

/// Outcome of [`PluginManager::load_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAllReport {
    /// Plugins loaded, in load order.
    pub loaded: Vec<PluginId>,
    /// Directories or ids that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Orchestrates plugin lifecycles, command routing and health.
pub struct PluginManager {
    config: PluginSystemConfig,
    loader: PluginLoader,
    registry: AsyncRwLock<PluginRegistry>,
    instances: RwLock<HashMap<PluginId, PluginInstance>>,
    sandboxes: SandboxManager,
    events: PluginEventBus,
    locks: DashMap<PluginId, Arc<Mutex<()>>>,
    watchers: DashMap<PluginId, CancellationToken>,
    host_version: Version,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .instances
            .read()
            .map(|i| i.len())
            .unwrap_or_default();
        f.debug_struct("PluginManager")
            .field("plugins", &count)
            .field("sandboxes", &self.sandboxes.len())
            .field("host_version", &self.host_version.to_string())
            .finish_non_exhaustive()
    }
}

/// Await a module hook, turning errors and panics into a message.
async fn call_hook<F>(hook: &str, fut: F) -> Result<(), String>
where
    F: Future<Output = Result<(), ModuleError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{hook} failed: {e}")),
        Err(panic) => Err(format!("{hook} panicked: {}", panic_message(panic.as_ref()))),
    }
}

impl PluginManager {
    /// A manager over the local filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if `config` is invalid.
    pub fn new(config: PluginSystemConfig, catalog: ModuleCatalog) -> PluginResult<Self> {
        Self::with_storage(config, catalog, Arc::new(FsStorage))
    }

    /// A manager reading plugins through `storage`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if `config` is invalid.
    pub fn with_storage(
        config: PluginSystemConfig,
        catalog: ModuleCatalog,
        storage: Arc<dyn PluginStorage>,
    ) -> PluginResult<Self> {
        config.validate()?;
        let host = StaticHostVersion::new(config.host_version()?);
        let loader = PluginLoader::new(storage, catalog, Arc::new(host))
            .with_block_high_severity(config.security.block_high_severity);
        Ok(Self::from_parts(config, loader, PluginRegistry::new()))
    }

    /// Assemble a manager from prepared parts.
    #[must_use]
    pub fn from_parts(config: PluginSystemConfig, loader: PluginLoader, registry: PluginRegistry) -> Self {
        let host_version = loader.host_version();
        Self {
            config,
            loader,
            registry: AsyncRwLock::new(registry),
            instances: RwLock::new(HashMap::new()),
            sandboxes: SandboxManager::new(),
            events: PluginEventBus::new(),
            locks: DashMap::new(),
            watchers: DashMap::new(),
            host_version,
        }
    }

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &PluginEventBus {
        &self.events
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PluginSystemConfig {
        &self.config
    }

    /// The loader.
    #[must_use]
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Read access to the registry.
    pub async fn registry(&self) -> RwLockReadGuard<'_, PluginRegistry> {
        self.registry.read().await
    }

    /// The sandbox attached to `id`, if any.
    #[must_use]
    pub fn sandbox_of(&self, id: &PluginId) -> Option<Arc<SandboxInstance>> {
        let sandbox_id = self.read_instance(id, |i| i.sandbox_id).flatten()?;
        self.sandboxes.get(&sandbox_id)
    }

    /// Snapshot of one plugin.
    #[must_use]
    pub fn plugin_info(&self, id: &PluginId) -> Option<PluginInfo> {
        self.read_instance(id, |i| PluginInfo {
            id: id.clone(),
            name: i.manifest.name.clone(),
            version: i.manifest.version.clone(),
            state: i.state,
            health: i.health,
            enabled: i.state == PluginState::Enabled,
            loaded_at: i.loaded_at,
            last_error: i.last_error.clone(),
            config: i.config.clone(),
            sandboxed: i.sandbox_id.is_some(),
            metrics: i.metrics.clone(),
            source: i.source.clone(),
        })
    }

    /// Snapshots of every plugin, ordered by id.
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        let mut ids = self.plugin_ids();
        ids.sort();
        ids.iter().filter_map(|id| self.plugin_info(id)).collect()
    }

    /// Ids of every managed plugin.
    #[must_use]
    pub fn plugin_ids(&self) -> Vec<PluginId> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Load a plugin and enable it if its merged config says so.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyLoaded`] if the id is managed (the
    /// existing instance is left untouched), any load pipeline error, or
    /// [`PluginError::ModuleLoad`] if the module's load hook fails.
    pub async fn load_plugin(&self, source: &str, source_type: SourceType) -> PluginResult<PluginId> {
        let manifest = self.loader.peek_manifest(source, source_type).await?;
        let id = manifest.plugin_id()?;
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        self.load_locked(&id, source, source_type, None).await?;
        Ok(id)
    }

    async fn load_locked(
        &self,
        id: &PluginId,
        source: &str,
        source_type: SourceType,
        config_override: Option<Value>,
    ) -> PluginResult<()> {
        if self.contains(id) {
            return Err(PluginError::AlreadyLoaded(id.clone()));
        }
        self.emit(PluginEvent::new(PluginEventKind::Loading, id.clone()));

        let known = self.registry.read().await.known_manifests();
        let loaded = match self.loader.load_from_source(source, source_type, &known).await {
            Ok(loaded) if loaded.plugin_id != *id => {
                self.loader.remove(&loaded.plugin_id);
                let err = PluginError::ModuleLoad {
                    plugin_id: id.clone(),
                    message: format!("source now declares id {}", loaded.plugin_id),
                };
                self.emit_error(id, &err);
                return Err(err);
            },
            Ok(loaded) => loaded,
            Err(e) => {
                self.emit_error(id, &e);
                return Err(e);
            },
        };

        if let Err(e) = self
            .registry
            .write()
            .await
            .register_plugin(loaded.manifest.clone(), Some(source.to_string()))
        {
            self.loader.remove(id);
            self.emit_error(id, &e);
            return Err(e);
        }

        let config = config_override.unwrap_or_else(|| {
            merge_plugin_config(
                &loaded.manifest.config,
                self.config.overrides_for(id),
                self.config.sandbox.enabled_by_default,
            )
        });
        let sandbox_id = config_flag(&config, SANDBOXED_KEY, self.config.sandbox.enabled_by_default)
            .then(|| {
                let policy = SandboxPolicy::from_manifest(
                    &loaded.manifest,
                    self.config.sandbox.limits.clone(),
                    self.config.sandbox_timeout(),
                    self.config.sandbox.max_resource_violations,
                );
                self.sandboxes.create_sandbox(id.clone(), policy)
            });

        let instance = PluginInstance {
            manifest: loaded.manifest.clone(),
            module: Arc::clone(&loaded.module),
            state: PluginState::Loading,
            health: HealthStatus::Unknown,
            loaded_at: Utc::now(),
            last_error: None,
            config: config.clone(),
            sandbox_id,
            metrics: PluginMetrics::default(),
            source: source.to_string(),
            source_type,
            dir: loaded.dir.clone(),
        };
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), instance);

        let ctx = self.hook_context(id)?;
        if let Err(message) = call_hook("on_load", loaded.module.on_load(&ctx)).await {
            self.mark_error(id, &message);
            return Err(PluginError::ModuleLoad {
                plugin_id: id.clone(),
                message,
            });
        }

        self.set_state(id, PluginState::Loaded);
        if let Err(e) = self.registry.write().await.set_installed(id, true) {
            debug!(plugin_id = %id, error = %e, "Registry entry missing after load");
        }
        info!(plugin_id = %id, version = %loaded.manifest.version, sandboxed = sandbox_id.is_some(), "Plugin loaded");
        self.emit(
            PluginEvent::new(PluginEventKind::Loaded, id.clone()).with_data(json!({
                "version": loaded.manifest.version,
                "warnings": loaded.warnings,
            })),
        );

        if config_flag(&config, ENABLED_KEY, true) {
            self.enable_locked(id).await?;
        }
        Ok(())
    }

    /// Start serving commands. A no-op if already enabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`], [`PluginError::InvalidState`] from
    /// a state that cannot be enabled, or [`PluginError::ExecutionFailed`] if
    /// the enable hook fails (the plugin moves to `error`).
    pub async fn enable_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.enable_locked(id).await
    }

    async fn enable_locked(&self, id: &PluginId) -> PluginResult<()> {
        let (state, module) = self
            .read_instance(id, |i| (i.state, Arc::clone(&i.module)))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        if state == PluginState::Enabled {
            return Ok(());
        }
        self.check_transition(id, state, PluginState::Enabled, "enable")?;

        let ctx = self.hook_context(id)?;
        if let Err(message) = call_hook("on_enable", module.on_enable(&ctx)).await {
            self.mark_error(id, &message);
            return Err(PluginError::ExecutionFailed(message));
        }

        self.set_state(id, PluginState::Enabled);
        if let Err(e) = self.registry.write().await.set_enabled(id, true) {
            debug!(plugin_id = %id, error = %e, "Registry entry missing on enable");
        }
        info!(plugin_id = %id, "Plugin enabled");
        self.emit(PluginEvent::new(PluginEventKind::Enabled, id.clone()));
        Ok(())
    }

    /// Stop serving commands. A no-op if already disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`], [`PluginError::InvalidState`] from
    /// a state that cannot be disabled, or [`PluginError::ExecutionFailed`]
    /// if the disable hook fails (the plugin moves to `error`).
    pub async fn disable_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.disable_locked(id).await
    }

    async fn disable_locked(&self, id: &PluginId) -> PluginResult<()> {
        let (state, module) = self
            .read_instance(id, |i| (i.state, Arc::clone(&i.module)))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        if state == PluginState::Disabled {
            return Ok(());
        }
        self.check_transition(id, state, PluginState::Disabled, "disable")?;

        let ctx = self.hook_context(id)?;
        if let Err(message) = call_hook("on_disable", module.on_disable(&ctx)).await {
            self.mark_error(id, &message);
            return Err(PluginError::ExecutionFailed(message));
        }

        self.set_state(id, PluginState::Disabled);
        if let Err(e) = self.registry.write().await.set_enabled(id, false) {
            debug!(plugin_id = %id, error = %e, "Registry entry missing on disable");
        }
        info!(plugin_id = %id, "Plugin disabled");
        self.emit(PluginEvent::new(PluginEventKind::Disabled, id.clone()));
        Ok(())
    }

    /// Disable if needed, run the unload hook and release the plugin.
    ///
    /// Stops hot reload for the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`], [`PluginError::HasDependents`]
    /// while another registered plugin requires it, or
    /// [`PluginError::InvalidState`] while a transition is in flight.
    pub async fn unload_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;
        self.unload_locked(id, Release::Unload).await?;
        self.disable_hot_reload(id);
        drop(guard);
        self.prune_lock(id, &lock);
        Ok(())
    }

    async fn unload_locked(&self, id: &PluginId, release: Release) -> PluginResult<()> {
        let state = self
            .read_instance(id, |i| i.state)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        if release == Release::Unload {
            let dependents = self.registry.read().await.get_dependents(id);
            if !dependents.is_empty() {
                return Err(PluginError::HasDependents {
                    plugin_id: id.clone(),
                    dependents,
                });
            }
        }

        if state == PluginState::Enabled {
            if let Err(e) = self.disable_locked(id).await {
                warn!(plugin_id = %id, error = %e, "Disable failed during unload, continuing");
            }
        }
        let state = self
            .read_instance(id, |i| i.state)
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        self.check_transition(id, state, PluginState::Unloading, "unload")?;
        self.set_state(id, PluginState::Unloading);

        let module = self
            .read_instance(id, |i| Arc::clone(&i.module))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        let ctx = self.hook_context(id)?;
        if let Err(message) = call_hook("on_unload", module.on_unload(&ctx)).await {
            warn!(plugin_id = %id, error = %message, "Unload hook failed, releasing anyway");
        }

        let removed = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(sandbox_id) = removed.and_then(|i| i.sandbox_id) {
            self.sandboxes.destroy_sandbox(&sandbox_id);
        }
        self.loader.remove(id);
        if release == Release::Unload {
            match self.registry.write().await.unregister_plugin(id) {
                Ok(_) | Err(PluginError::NotFound(_)) => {},
                Err(e) => warn!(plugin_id = %id, error = %e, "Failed to unregister plugin"),
            }
        }

        info!(plugin_id = %id, "Plugin unloaded");
        self.emit(PluginEvent::new(PluginEventKind::Unloaded, id.clone()));
        Ok(())
    }

    /// Unload and load again from the same source, keeping the merged
    /// configuration. Also the way out of the `error` state.
    ///
    /// Dependents do not block a reload. The registry entry stays in place
    /// and is refreshed from the new manifest.
    ///
    /// # Errors
    ///
    /// Returns the unload error (nothing is loaded in that case) or the
    /// load error.
    pub async fn reload_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (source, source_type, config) = self
            .read_instance(id, |i| (i.source.clone(), i.source_type, i.config.clone()))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        self.unload_locked(id, Release::Reload).await?;
        self.load_locked(id, &source, source_type, Some(config)).await?;

        info!(plugin_id = %id, "Plugin reloaded");
        self.emit(PluginEvent::new(PluginEventKind::Reloaded, id.clone()));
        Ok(())
    }

    /// Load `id` again after a reload lost it at the load step.
    #[cfg(feature = "watch")]
    async fn restore_plugin(&self, id: &PluginId, snapshot: &ReloadSnapshot) -> PluginResult<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let (source, source_type, config) = snapshot;
        self.load_locked(id, source, *source_type, Some(config.clone()))
            .await?;

        info!(plugin_id = %id, "Plugin restored after failed reload");
        self.emit(PluginEvent::new(PluginEventKind::Reloaded, id.clone()));
        Ok(())
    }

    /// Run `command` on an enabled plugin, inside its sandbox when it has one.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`], [`PluginError::InvalidState`] if
    /// the plugin is not enabled (nothing is executed), or the execution
    /// failure.
    pub async fn execute_plugin_command(
        &self,
        id: &PluginId,
        command: &str,
        params: Value,
    ) -> PluginResult<Value> {
        let (state, module, sandbox_id) = self
            .read_instance(id, |i| (i.state, Arc::clone(&i.module), i.sandbox_id))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        if state != PluginState::Enabled {
            return Err(PluginError::InvalidState {
                plugin_id: id.clone(),
                state,
                operation: "execute",
            });
        }

        let base = self.base_context(id)?;
        let started = Instant::now();
        let outcome = match sandbox_id {
            Some(sandbox_id) => {
                match self
                    .sandboxes
                    .execute_in_sandbox(&sandbox_id, module.as_ref(), &base, command, params)
                    .await
                {
                    Ok(exec) if exec.success => Ok(exec.result.unwrap_or(Value::Null)),
                    Ok(exec) => Err(exec
                        .error
                        .unwrap_or_else(|| PluginError::ExecutionFailed("sandboxed call failed".into()))),
                    Err(e) => Err(e),
                }
            },
            None => match AssertUnwindSafe(module.execute(&base, command, params))
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(PluginError::ExecutionFailed(e.to_string())),
                Err(panic) => Err(PluginError::ExecutionFailed(format!(
                    "plugin panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
        };
        let elapsed = started.elapsed();

        self.with_instance(id, |i| i.metrics.record(elapsed, outcome.is_ok()));
        match &outcome {
            Ok(_) => debug!(plugin_id = %id, command, elapsed_ms = elapsed.as_millis(), "Command executed"),
            Err(e) => warn!(plugin_id = %id, command, error = %e, "Command failed"),
        }
        outcome
    }

    /// Deliver `payload` from one plugin to another enabled plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] for either id,
    /// [`PluginError::InvalidState`] if the target is not enabled, or
    /// [`PluginError::ExecutionFailed`] if the handler fails.
    pub async fn send_message(
        &self,
        from: &PluginId,
        to: &PluginId,
        payload: Value,
    ) -> PluginResult<Option<Value>> {
        if !self.contains(from) {
            return Err(PluginError::NotFound(from.clone()));
        }
        let (state, module) = self
            .read_instance(to, |i| (i.state, Arc::clone(&i.module)))
            .ok_or_else(|| PluginError::NotFound(to.clone()))?;
        if state != PluginState::Enabled {
            return Err(PluginError::InvalidState {
                plugin_id: to.clone(),
                state,
                operation: "receive messages",
            });
        }

        let ctx = self.hook_context(to)?;
        match AssertUnwindSafe(module.on_message(&ctx, from, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(reply)) => {
                debug!(from = %from, to = %to, replied = reply.is_some(), "Plugin message delivered");
                Ok(reply)
            },
            Ok(Err(e)) => Err(PluginError::ExecutionFailed(e.to_string())),
            Err(panic) => Err(PluginError::ExecutionFailed(format!(
                "message handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Deep-merge `overrides` into the plugin's configuration.
    ///
    /// The module's config hook sees the new configuration first; if it
    /// fails the old configuration is kept.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`], [`PluginError::Config`] if
    /// `overrides` is not an object, or [`PluginError::ExecutionFailed`] if
    /// the hook rejects the change.
    pub async fn update_plugin_config(&self, id: &PluginId, overrides: Value) -> PluginResult<Value> {
        if !overrides.is_object() {
            return Err(PluginError::Config {
                field: format!("plugins.{id}"),
                message: "overrides must be an object".into(),
            });
        }
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (mut config, module) = self
            .read_instance(id, |i| (i.config.clone(), Arc::clone(&i.module)))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        deep_merge(&mut config, &overrides);

        let ctx = self.hook_context(id)?.with_config(config.clone());
        if let Err(message) = call_hook("on_config_change", module.on_config_change(&ctx, &config)).await {
            return Err(PluginError::ExecutionFailed(message));
        }

        self.with_instance(id, |i| i.config = config.clone());
        info!(plugin_id = %id, "Plugin configuration updated");
        self.emit(PluginEvent::new(PluginEventKind::ConfigChanged, id.clone()).with_data(config.clone()));
        Ok(config)
    }

    /// Run every health check for one plugin and record the result.
    ///
    /// Emits `health-changed` when the overall status differs from the
    /// previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`].
    pub async fn check_plugin_health(&self, id: &PluginId) -> PluginResult<HealthReport> {
        let (state, last_error, module, sandbox_id) = self
            .read_instance(id, |i| {
                (i.state, i.last_error.clone(), Arc::clone(&i.module), i.sandbox_id)
            })
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;

        let mut checks = vec![
            HealthCheck::expect("loaded", state.is_loaded(), format!("plugin is {state}")),
            HealthCheck::expect("enabled", state == PluginState::Enabled, format!("plugin is {state}")),
            HealthCheck::expect(
                "no-error",
                last_error.is_none() && state != PluginState::Error,
                last_error.clone().unwrap_or_else(|| "plugin is in error state".into()),
            ),
        ];
        if state.is_loaded() {
            let ctx = self.hook_context(id)?;
            if let Some(probe) = run_probe(module.as_ref(), &ctx, self.config.health_probe_timeout()).await {
                checks.push(probe);
            }
        }
        if let Some(sandbox) = sandbox_id.and_then(|sid| self.sandboxes.get(&sid)) {
            let exceeded = sandbox
                .usage()
                .exceeded(&sandbox.policy().limits, sandbox.lifetime());
            let message = if exceeded.is_empty() {
                "sandbox terminated".to_string()
            } else {
                exceeded.join(", ")
            };
            checks.push(HealthCheck::expect("sandbox-limits", sandbox.is_within_limits(), message));
        }

        let report = HealthReport::from_checks(id.clone(), checks);
        let previous = self.with_instance(id, |i| std::mem::replace(&mut i.health, report.status));
        if let Some(previous) = previous {
            if previous != report.status {
                info!(plugin_id = %id, from = %previous, to = %report.status, "Plugin health changed");
                self.emit(
                    PluginEvent::new(PluginEventKind::HealthChanged, id.clone()).with_data(json!({
                        "previous": previous,
                        "current": report.status,
                        "failures": report.failures().map(|c| c.name.clone()).collect::<Vec<_>>(),
                    })),
                );
            }
        }
        Ok(report)
    }

    /// Check every enabled plugin in id order. A plugin that disappears
    /// mid-tick is skipped.
    pub async fn run_health_checks(&self) -> Vec<HealthReport> {
        let mut ids: Vec<PluginId> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, i)| i.state == PluginState::Enabled)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            match self.check_plugin_health(&id).await {
                Ok(report) => reports.push(report),
                Err(e) => debug!(plugin_id = %id, error = %e, "Skipping health check"),
            }
        }
        reports
    }

    /// Run health checks every `health_check_interval_secs` until `cancel`.
    #[must_use]
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let reports = manager.run_health_checks().await;
                        debug!(checked = reports.len(), "Health tick finished");
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    /// Watch the plugin's directory and reload it after changes settle.
    ///
    /// Reload failures are logged, never returned. Calling this again for a
    /// watched plugin is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] or a watcher setup error.
    #[cfg(feature = "watch")]
    pub fn enable_hot_reload(self: &Arc<Self>, id: &PluginId) -> PluginResult<()> {
        use crate::watcher::{PluginWatcher, WatchEvent};

        if self.watchers.contains_key(id) {
            return Ok(());
        }
        let (dir, mut snapshot) = self
            .read_instance(id, |i| (i.dir.clone(), reload_snapshot(i)))
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        let (watcher, mut rx) = PluginWatcher::new(dir, self.config.debounce())?;
        let cancel = CancellationToken::new();
        self.watchers.insert(id.clone(), cancel.clone());
        tokio::spawn(watcher.run(cancel));

        info!(plugin_id = %id, "Hot reload enabled");
        let manager = Arc::downgrade(self);
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    WatchEvent::Changed { source_hash, .. } => {
                        let Some(manager) = manager.upgrade() else { break };
                        if !manager.is_hot_reload_enabled(&id) {
                            break;
                        }
                        info!(plugin_id = %id, hash = %source_hash, "Hot reloading plugin");
                        let result = match manager.read_instance(&id, reload_snapshot) {
                            Some(current) => {
                                snapshot = current;
                                manager.reload_plugin(&id).await
                            },
                            None => manager.restore_plugin(&id, &snapshot).await,
                        };
                        if let Err(e) = result {
                            error!(plugin_id = %id, error = %e, "Hot reload failed");
                        }
                    },
                    WatchEvent::Error(message) => {
                        warn!(plugin_id = %id, error = %message, "Hot reload watcher error");
                    },
                }
            }
            debug!(plugin_id = %id, "Hot reload stopped");
        });
        Ok(())
    }

    /// Hot reload needs the `watch` feature.
    ///
    /// # Errors
    ///
    /// Always returns [`PluginError::NotImplemented`].
    #[cfg(not(feature = "watch"))]
    pub fn enable_hot_reload(self: &Arc<Self>, _id: &PluginId) -> PluginResult<()> {
        Err(PluginError::NotImplemented(
            "hot reload (built without the `watch` feature)".into(),
        ))
    }

    /// Stop watching `id`. Returns whether it was watched.
    pub fn disable_hot_reload(&self, id: &PluginId) -> bool {
        match self.watchers.remove(id) {
            Some((_, cancel)) => {
                cancel.cancel();
                debug!(plugin_id = %id, "Hot reload disabled");
                true
            },
            None => false,
        }
    }

    /// Whether `id` is being watched for changes.
    #[must_use]
    pub fn is_hot_reload_enabled(&self, id: &PluginId) -> bool {
        self.watchers.contains_key(id)
    }

    /// Discover the plugin directory and load everything in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the plugin directory cannot be listed.
    /// Individual plugins never fail the whole call.
    pub async fn load_all(&self) -> PluginResult<LoadAllReport> {
        let discovery = self.loader.discover_plugins(&self.config.plugin_dir).await?;
        let mut report = LoadAllReport {
            loaded: Vec::new(),
            failed: discovery
                .failed
                .iter()
                .map(|f| (f.path.display().to_string(), f.error.clone()))
                .collect(),
        };

        let mut dirs: HashMap<String, PathBuf> = HashMap::new();
        let mut manifests: HashMap<String, PluginManifest> = HashMap::new();
        for found in discovery.discovered {
            if let Ok(id) = found.manifest.plugin_id() {
                self.emit(
                    PluginEvent::new(PluginEventKind::Discovered, id)
                        .with_data(json!({"path": found.dir.display().to_string()})),
                );
            }
            dirs.insert(found.manifest.id.clone(), found.dir);
            manifests.insert(found.manifest.id.clone(), found.manifest);
        }

        let order = DependencyResolver::order_all(&manifests).unwrap_or_else(|cycle| {
            warn!(cycle = %cycle.join(" -> "), "Dependency cycle among discovered plugins");
            let mut ids: Vec<String> = manifests.keys().cloned().collect();
            ids.sort();
            ids
        });

        for plugin in order {
            let Some(dir) = dirs.get(&plugin) else { continue };
            let source = dir.display().to_string();
            match self.load_plugin(&source, SourceType::LocalPath).await {
                Ok(id) => report.loaded.push(id),
                Err(e) => {
                    warn!(plugin_id = %plugin, error = %e, "Failed to load plugin");
                    report.failed.push((plugin, e.to_string()));
                },
            }
        }
        info!(loaded = report.loaded.len(), failed = report.failed.len(), "Loaded plugins");
        Ok(report)
    }

    /// Stop every watcher and unload all plugins, dependents first.
    pub async fn shutdown(&self) {
        let watched: Vec<PluginId> = self.watchers.iter().map(|e| e.key().clone()).collect();
        for id in &watched {
            self.disable_hot_reload(id);
        }

        let manifests: HashMap<String, PluginManifest> = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, i)| (id.to_string(), i.manifest.clone()))
            .collect();
        let mut order = DependencyResolver::order_all(&manifests).unwrap_or_else(|_| {
            let mut ids: Vec<String> = manifests.keys().cloned().collect();
            ids.sort();
            ids
        });
        order.reverse();

        for plugin in order {
            let Ok(id) = PluginId::new(plugin) else { continue };
            if let Err(e) = self.unload_plugin(&id).await {
                warn!(plugin_id = %id, error = %e, "Failed to unload plugin during shutdown");
            }
        }
        info!("Plugin manager shut down");
    }

    fn lock_for(&self, id: &PluginId) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Drop the lock entry for a released plugin unless someone else holds
    /// or waits on it. `held` is the caller's own handle.
    fn prune_lock(&self, id: &PluginId, held: &Arc<Mutex<()>>) {
        self.locks
            .remove_if(id, |_, lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) <= 2);
    }

    fn contains(&self, id: &PluginId) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn read_instance<R>(&self, id: &PluginId, f: impl FnOnce(&PluginInstance) -> R) -> Option<R> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(f)
    }

    fn with_instance<R>(&self, id: &PluginId, f: impl FnOnce(&mut PluginInstance) -> R) -> Option<R> {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
            .map(f)
    }

    fn set_state(&self, id: &PluginId, state: PluginState) {
        self.with_instance(id, |i| {
            debug!(plugin_id = %id, from = %i.state, to = %state, "Plugin state transition");
            i.state = state;
        });
    }

    fn check_transition(
        &self,
        id: &PluginId,
        from: PluginState,
        to: PluginState,
        operation: &'static str,
    ) -> PluginResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(PluginError::InvalidState {
                plugin_id: id.clone(),
                state: from,
                operation,
            })
        }
    }

    /// Context with the plugin's config, not yet confined.
    fn base_context(&self, id: &PluginId) -> PluginResult<ModuleContext> {
        self.read_instance(id, |i| {
            ModuleContext::unrestricted(id.clone(), i.dir.clone(), self.host_version.clone())
                .with_config(i.config.clone())
        })
        .ok_or_else(|| PluginError::NotFound(id.clone()))
    }

    /// Context for lifecycle hooks, confined when the plugin is sandboxed.
    fn hook_context(&self, id: &PluginId) -> PluginResult<ModuleContext> {
        let base = self.base_context(id)?;
        Ok(match self.sandbox_of(id) {
            Some(sandbox) => base.confined(sandbox, None),
            None => base,
        })
    }

    fn mark_error(&self, id: &PluginId, message: &str) {
        error!(plugin_id = %id, error = %message, "Plugin entered error state");
        self.with_instance(id, |i| {
            i.state = PluginState::Error;
            i.last_error = Some(message.to_string());
        });
        self.emit(PluginEvent::new(PluginEventKind::Error, id.clone()).with_error(message));
    }

    fn emit_error(&self, id: &PluginId, err: &PluginError) {
        warn!(plugin_id = %id, error = %err, "Plugin load failed");
        self.emit(PluginEvent::new(PluginEventKind::Error, id.clone()).with_error(err.to_string()));
    }

    fn emit(&self, event: PluginEvent) {
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::error::ErrorCode;

    #[derive(Default)]
    struct Switches {
        fail_load: AtomicBool,
        fail_probe: AtomicBool,
        reject_config: AtomicBool,
        executions: AtomicUsize,
        unloads: AtomicUsize,
    }

    struct Echo(Arc<Switches>);

    #[async_trait]
    impl PluginModule for Echo {
        async fn on_load(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            if self.0.fail_load.load(Ordering::SeqCst) {
                return Err(ModuleError::Failed("missing token".into()));
            }
            Ok(())
        }

        async fn on_unload(&self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            self.0.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_config_change(&self, _ctx: &ModuleContext, _config: &Value) -> Result<(), ModuleError> {
            if self.0.reject_config.load(Ordering::SeqCst) {
                return Err(ModuleError::InvalidParams("bad config".into()));
            }
            Ok(())
        }

        async fn on_message(
            &self,
            _ctx: &ModuleContext,
            from: &PluginId,
            payload: Value,
        ) -> Result<Option<Value>, ModuleError> {
            Ok(Some(json!({"from": from.as_str(), "echo": payload})))
        }

        async fn health_probe(&self, _ctx: &ModuleContext) -> Option<Result<(), ModuleError>> {
            if self.0.fail_probe.load(Ordering::SeqCst) {
                Some(Err(ModuleError::Failed("backend down".into())))
            } else {
                Some(Ok(()))
            }
        }

        async fn execute(&self, ctx: &ModuleContext, command: &str, params: Value) -> Result<Value, ModuleError> {
            self.0.executions.fetch_add(1, Ordering::SeqCst);
            match command {
                "echo" => Ok(json!({"params": params, "greeting": ctx.config()["greeting"]})),
                "boom" => Err(ModuleError::Failed("boom".into())),
                other => Err(ModuleError::UnknownCommand(other.to_string())),
            }
        }
    }

    fn write_plugin(root: &Path, id: &str, extra: &str) -> String {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!(
                "id = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nauthor = \"kat\"\nmain = \"echo\"\n\
                 description = \"test\"\ncommands = [\"echo\", \"boom\"]\n{extra}"
            ),
        )
        .unwrap();
        dir.display().to_string()
    }

    fn manager(root: &TempDir, switches: &Arc<Switches>, tweak: impl FnOnce(&mut PluginSystemConfig)) -> PluginManager {
        let switches = Arc::clone(switches);
        let catalog = ModuleCatalog::new().with("echo", move |_| {
            Ok(Arc::new(Echo(Arc::clone(&switches))) as Arc<dyn PluginModule>)
        });
        let mut config = PluginSystemConfig {
            plugin_dir: root.path().to_path_buf(),
            host_version: "1.0.0".into(),
            ..PluginSystemConfig::default()
        };
        tweak(&mut config);
        PluginManager::new(config, catalog).unwrap()
    }

    fn id(s: &'static str) -> PluginId {
        PluginId::from_static(s)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<PluginEvent>) -> Vec<PluginEventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_load_enables_by_default_and_emits_in_order() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let mut rx = manager.events().subscribe_channel();

        let source = write_plugin(root.path(), "echo", "");
        let loaded = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        assert_eq!(loaded, id("echo"));

        let info = manager.plugin_info(&loaded).unwrap();
        assert_eq!(info.state, PluginState::Enabled);
        assert!(info.enabled);
        assert!(info.sandboxed);
        assert_eq!(info.config["enabled"], json!(true));
        assert!(manager.registry().await.get(&loaded).unwrap().enabled);
        assert_eq!(
            drain(&mut rx),
            vec![PluginEventKind::Loading, PluginEventKind::Loaded, PluginEventKind::Enabled]
        );
    }

    #[tokio::test]
    async fn test_duplicate_load_leaves_instance_untouched() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "");
        manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        let before = manager.plugin_info(&id("echo")).unwrap();

        let err = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginAlreadyLoaded);
        assert_eq!(manager.plugin_info(&id("echo")).unwrap(), before);
    }

    #[tokio::test]
    async fn test_disabled_plugin_refuses_commands() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |c| {
            c.plugins.insert("echo".into(), json!({"enabled": false}));
        });
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        assert_eq!(manager.plugin_info(&echo).unwrap().state, PluginState::Loaded);

        let err = manager
            .execute_plugin_command(&echo, "echo", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidState { operation: "execute", .. }));
        assert_eq!(switches.executions.load(Ordering::SeqCst), 0);

        manager.enable_plugin(&echo).await.unwrap();
        manager.enable_plugin(&echo).await.unwrap();
        manager.disable_plugin(&echo).await.unwrap();
        manager.disable_plugin(&echo).await.unwrap();
        assert_eq!(manager.plugin_info(&echo).unwrap().state, PluginState::Disabled);
    }

    #[tokio::test]
    async fn test_execute_records_metrics_and_honors_sandbox() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |c| {
            c.plugins.insert("echo".into(), json!({"greeting": "hi"}));
        });
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();

        let out = manager
            .execute_plugin_command(&echo, "echo", json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(out["greeting"], json!("hi"));
        assert!(manager.execute_plugin_command(&echo, "boom", json!({})).await.is_err());

        let err = manager
            .execute_plugin_command(&echo, "format_disk", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OperationNotAllowed);

        let info = manager.plugin_info(&echo).unwrap();
        assert_eq!(info.metrics.execution_count, 3);
        assert_eq!(info.metrics.error_count, 2);
        assert!(info.last_error.is_none());
        assert_eq!(switches.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsandboxed_execution_calls_module_directly() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |c| c.sandbox.enabled_by_default = false);
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        assert!(manager.sandbox_of(&echo).is_none());

        let err = manager
            .execute_plugin_command(&echo, "undeclared", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionFailed);
        assert_eq!(switches.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_hook_enters_error_and_reload_recovers() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        switches.fail_load.store(true, Ordering::SeqCst);
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "");

        let err = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModuleLoadError);
        let info = manager.plugin_info(&id("echo")).unwrap();
        assert_eq!(info.state, PluginState::Error);
        assert!(info.last_error.unwrap().contains("missing token"));

        let err = manager.enable_plugin(&id("echo")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        switches.fail_load.store(false, Ordering::SeqCst);
        manager.reload_plugin(&id("echo")).await.unwrap();
        let info = manager.plugin_info(&id("echo")).unwrap();
        assert_eq!(info.state, PluginState::Enabled);
        assert!(info.last_error.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_failure_keeps_no_instance() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let mut rx = manager.events().subscribe_channel();
        let source = write_plugin(
            root.path(),
            "needy",
            "[[dependencies]]\nname = \"storage\"\nversion = \"^1.0.0\"\n",
        );

        let err = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DependencyResolutionFailed);
        assert!(manager.plugin_info(&id("needy")).is_none());
        assert!(manager.registry().await.is_empty());
        assert_eq!(drain(&mut rx), vec![PluginEventKind::Loading, PluginEventKind::Error]);
    }

    #[tokio::test]
    async fn test_unload_refuses_while_dependents_remain() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let storage = write_plugin(root.path(), "storage", "");
        let cache = write_plugin(
            root.path(),
            "cache",
            "[[dependencies]]\nname = \"storage\"\nversion = \"^1.0.0\"\n",
        );
        manager.load_plugin(&storage, SourceType::LocalPath).await.unwrap();
        manager.load_plugin(&cache, SourceType::LocalPath).await.unwrap();

        let err = manager.unload_plugin(&id("storage")).await.unwrap_err();
        match err {
            PluginError::HasDependents { dependents, .. } => assert_eq!(dependents, vec!["cache".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.plugin_info(&id("storage")).unwrap().state, PluginState::Enabled);

        manager.unload_plugin(&id("cache")).await.unwrap();
        manager.unload_plugin(&id("storage")).await.unwrap();
        assert!(manager.list_plugins().is_empty());
        assert_eq!(switches.unloads.load(Ordering::SeqCst), 2);
        assert!(manager.sandboxes.is_empty());
        assert!(!manager.loader().is_loaded(&id("storage")));
    }

    #[tokio::test]
    async fn test_reload_of_required_plugin_keeps_dependents() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let storage = write_plugin(root.path(), "storage", "");
        let cache = write_plugin(
            root.path(),
            "cache",
            "[[dependencies]]\nname = \"storage\"\nversion = \"^1.0.0\"\n",
        );
        manager.load_plugin(&storage, SourceType::LocalPath).await.unwrap();
        manager.load_plugin(&cache, SourceType::LocalPath).await.unwrap();

        manager.reload_plugin(&id("storage")).await.unwrap();
        assert_eq!(manager.plugin_info(&id("storage")).unwrap().state, PluginState::Enabled);
        assert_eq!(manager.registry().await.get_dependents(&id("storage")), vec!["cache".to_string()]);

        switches.fail_load.store(true, Ordering::SeqCst);
        let err = manager.reload_plugin(&id("storage")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModuleLoadError);
        assert_eq!(manager.plugin_info(&id("storage")).unwrap().state, PluginState::Error);

        switches.fail_load.store(false, Ordering::SeqCst);
        manager.reload_plugin(&id("storage")).await.unwrap();
        assert_eq!(manager.plugin_info(&id("storage")).unwrap().state, PluginState::Enabled);
        assert_eq!(manager.plugin_info(&id("cache")).unwrap().state, PluginState::Enabled);
    }

    #[tokio::test]
    async fn test_unload_releases_transition_lock() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        assert!(manager.locks.contains_key(&echo));

        manager.unload_plugin(&echo).await.unwrap();
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_reload_preserves_updated_config() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "[config]\nlevel = 1\n");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();
        let mut rx = manager.events().subscribe_channel();

        let merged = manager
            .update_plugin_config(&echo, json!({"level": 2, "extra": {"x": true}}))
            .await
            .unwrap();
        assert_eq!(merged["level"], json!(2));
        assert_eq!(merged["enabled"], json!(true));

        manager.reload_plugin(&echo).await.unwrap();
        let info = manager.plugin_info(&echo).unwrap();
        assert_eq!(info.config["level"], json!(2));
        assert_eq!(info.config["extra"]["x"], json!(true));

        let kinds = drain(&mut rx);
        assert_eq!(kinds.first(), Some(&PluginEventKind::ConfigChanged));
        assert_eq!(kinds.last(), Some(&PluginEventKind::Reloaded));
        assert!(kinds.contains(&PluginEventKind::Unloaded));
    }

    #[tokio::test]
    async fn test_rejected_config_is_not_applied() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();

        let err = manager.update_plugin_config(&echo, json!(3)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigError);

        switches.reject_config.store(true, Ordering::SeqCst);
        assert!(manager.update_plugin_config(&echo, json!({"level": 9})).await.is_err());
        assert!(manager.plugin_info(&echo).unwrap().config.get("level").is_none());
    }

    #[tokio::test]
    async fn test_health_changed_fires_only_on_change() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let source = write_plugin(root.path(), "echo", "");
        let echo = manager.load_plugin(&source, SourceType::LocalPath).await.unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        manager
            .events()
            .subscribe(Some(vec![PluginEventKind::HealthChanged]), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let report = manager.check_plugin_health(&echo).await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        manager.run_health_checks().await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        switches.fail_probe.store(true, Ordering::SeqCst);
        let report = manager.check_plugin_health(&echo).await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.failures().next().unwrap().name, "probe");
        manager.check_plugin_health(&echo).await.unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(manager.plugin_info(&echo).unwrap().health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_send_message_requires_enabled_target() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        let a = manager
            .load_plugin(&write_plugin(root.path(), "alpha", ""), SourceType::LocalPath)
            .await
            .unwrap();
        let b = manager
            .load_plugin(&write_plugin(root.path(), "beta", ""), SourceType::LocalPath)
            .await
            .unwrap();

        let reply = manager.send_message(&a, &b, json!("ping")).await.unwrap().unwrap();
        assert_eq!(reply, json!({"from": "alpha", "echo": "ping"}));

        manager.disable_plugin(&b).await.unwrap();
        let err = manager.send_message(&a, &b, json!("ping")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        let err = manager.send_message(&id("ghost"), &a, json!(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginNotFound);
    }

    #[tokio::test]
    async fn test_load_all_orders_dependencies_and_shutdown_releases_everything() {
        let root = TempDir::new().unwrap();
        let switches = Arc::new(Switches::default());
        let manager = manager(&root, &switches, |_| {});
        write_plugin(
            root.path(),
            "a-cache",
            "[[dependencies]]\nname = \"z-storage\"\nversion = \"^1.0.0\"\n",
        );
        write_plugin(root.path(), "z-storage", "");
        std::fs::create_dir(root.path().join("junk")).unwrap();

        let report = manager.load_all().await.unwrap();
        assert_eq!(report.loaded, vec![id("z-storage"), id("a-cache")]);
        assert_eq!(report.failed.len(), 1);

        manager.shutdown().await;
        assert!(manager.list_plugins().is_empty());
        assert!(manager.registry().await.is_empty());
    }
}
