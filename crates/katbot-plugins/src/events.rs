//! Plugin lifecycle events.
//!
//! The [`PluginEventBus`] delivers every [`PluginEvent`] to two kinds of
//! subscriber: broadcast receivers for async consumers, and synchronous
//! callback listeners that can filter by [`PluginEventKind`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::plugin::PluginId;
use crate::sandbox::panic_message;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// The closed set of plugin events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginEventKind {
    /// Found on storage.
    Discovered,
    /// Load started.
    Loading,
    /// Module instantiated.
    Loaded,
    /// Serving commands.
    Enabled,
    /// Stopped serving commands.
    Disabled,
    /// A lifecycle step failed.
    Error,
    /// Removed.
    Unloaded,
    /// Unloaded and loaded again from the same source.
    Reloaded,
    /// Overall health status changed.
    HealthChanged,
    /// Configuration replaced.
    ConfigChanged,
}

impl PluginEventKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Unloaded => "unloaded",
            Self::Reloaded => "reloaded",
            Self::HealthChanged => "health-changed",
            Self::ConfigChanged => "config-changed",
        }
    }
}

impl fmt::Display for PluginEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// What happened.
    pub kind: PluginEventKind,
    /// The plugin it happened to.
    pub plugin_id: PluginId,
    /// When.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error text for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginEvent {
    /// An event stamped now.
    #[must_use]
    pub fn new(kind: PluginEventKind, plugin_id: PluginId) -> Self {
        Self {
            kind,
            plugin_id,
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Callback listener type.
pub type EventListener = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

/// Handle returned by [`PluginEventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscription {
    kinds: Option<Vec<PluginEventKind>>,
    listener: EventListener,
}

impl Subscription {
    fn accepts(&self, kind: PluginEventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Publish/subscribe hub for plugin events.
pub struct PluginEventBus {
    sender: broadcast::Sender<PluginEvent>,
    listeners: RwLock<HashMap<SubscriptionId, Subscription>>,
}

impl fmt::Debug for PluginEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEventBus")
            .field("receivers", &self.sender.receiver_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for PluginEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginEventBus {
    /// Create a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Deliver `event` to every receiver and matching listener.
    ///
    /// Returns the number of broadcast receivers. A panicking listener is
    /// logged and does not affect the others.
    pub fn publish(&self, event: PluginEvent) -> usize {
        trace!(kind = %event.kind, plugin_id = %event.plugin_id, "Publishing plugin event");
        let count = self.sender.send(event.clone()).unwrap_or(0);

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for (id, subscription) in listeners.iter() {
            if !subscription.accepts(event.kind) {
                continue;
            }
            let listener = &subscription.listener;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
            if let Err(payload) = result {
                warn!(
                    subscription_id = ?id,
                    kind = %event.kind,
                    panic = %panic_message(payload.as_ref()),
                    "Plugin event listener panicked"
                );
            }
        }
        count
    }

    /// Register a callback for `kinds`, or for every kind when `None`.
    pub fn subscribe<F>(&self, kinds: Option<Vec<PluginEventKind>>, listener: F) -> SubscriptionId
    where
        F: Fn(&PluginEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscription {
                    kinds,
                    listener: Arc::new(listener),
                },
            );
        debug!(subscription_id = ?id, "Plugin event listener registered");
        id
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// A broadcast receiver for every subsequent event.
    #[must_use]
    pub fn subscribe_channel(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    /// Number of callback listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
