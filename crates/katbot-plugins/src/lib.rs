//! Plugin management for the Katbot host.
//!
//! Provides the pieces a host needs to run third-party plugins:
//!
//! - [`PluginManifest`] / [`ManifestValidator`]: plugin identity, dependencies and bounds
//! - [`PluginRegistry`]: installed plugins, the dependency graph, search and persistence
//! - [`DependencyResolver`]: caret/tilde/range constraints and load order
//! - [`PluginLoader`]: discovery and the load pipeline (validate, scan, resolve, instantiate)
//! - [`SandboxManager`]: allowlisted, time-bounded, resource-accounted execution
//! - [`PluginManager`]: lifecycle state machine, command routing, health and hot reload
//! - [`PluginEventBus`]: lifecycle notifications for the rest of the host
//!
//! # Lifecycle
//!
//! ```text
//! loading → loaded ⇄ enabled / disabled → unloading → unloaded
//!              ↘ error (left by reload or unload)
//! ```
//!
//! Plugin code is an in-process [`PluginModule`]. The sandbox is a policy
//! layer over it, not an OS isolation boundary.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod marketplace;
pub mod metrics;
pub mod module;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod sandbox;
pub mod scan;
pub mod storage;
pub mod validate;
pub mod version;
pub mod watcher;

pub use config::PluginSystemConfig;
pub use error::{ErrorCode, PluginError, PluginResult};
pub use events::{PluginEvent, PluginEventBus, PluginEventKind, SubscriptionId};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use loader::{LoadStrategy, LoadedPlugin, PluginLoader, SourceType};
pub use manager::{LoadAllReport, PluginInfo, PluginManager};
pub use manifest::{Dependency, PluginManifest};
pub use marketplace::{Marketplace, MarketplaceListing};
pub use metrics::PluginMetrics;
pub use module::{DeclarativeModule, ModuleCatalog, ModuleError, PluginModule};
pub use plugin::{PluginId, PluginState};
pub use registry::{DependencyTree, PluginRegistry, RegistryEntry, SearchQuery, SearchResult};
pub use resolver::{DependencyResolver, Resolution};
pub use sandbox::{ModuleContext, ResourceLimits, SandboxId, SandboxManager, SandboxPolicy};
pub use scan::{ScanFinding, ScanReport, scan_source};
pub use storage::{FsStorage, PluginStorage};
pub use validate::{ManifestValidator, ValidationReport};
pub use version::{Version, VersionConstraint};
#[cfg(feature = "watch")]
pub use watcher::PluginWatcher;
