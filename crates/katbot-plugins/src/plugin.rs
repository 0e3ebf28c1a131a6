//! Plugin identity and lifecycle state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Longest accepted plugin id.
pub const MAX_ID_LEN: usize = 128;

/// Unique, stable, human-readable plugin identifier.
///
/// Plugin IDs are strings like `"weather"` or `"dice_roller"`. They must be
/// non-empty and contain only ASCII alphanumerics, `-`, `_` and `.`; a leading
/// dot and `..` sequences are rejected because ids double as directory names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation so crafted snapshots cannot smuggle in
/// path-like ids.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the ID is empty, too long or
    /// contains invalid characters.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin ID without constructing one.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(PluginError::InvalidId(format!(
                "plugin id must be at most {MAX_ID_LEN} characters, got {}",
                id.len()
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(PluginError::InvalidId(format!(
                "plugin id may only contain ASCII letters, digits, '-', '_' and '.', got: {id}"
            )));
        }
        if id.starts_with('.') || id.contains("..") {
            return Err(PluginError::InvalidId(format!(
                "plugin id must not start with '.' or contain '..', got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The lifecycle state of a managed plugin.
///
/// ```text
/// Discovered -> Loading -> Loaded -> Enabled <-> Disabled
///                  |         |         |            |
///                  v         v         v            v
///                Error <--------------------------- +
///
/// {Loaded, Enabled, Disabled, Error} -> Unloading -> Unloaded
/// Error -> Loading (explicit reload only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Found on storage, not yet loaded.
    Discovered,
    /// Manifest checks and module instantiation in progress.
    Loading,
    /// Module instantiated, not serving commands.
    Loaded,
    /// Serving commands.
    Enabled,
    /// Loaded but refusing commands.
    Disabled,
    /// Cleanup in progress.
    Unloading,
    /// Released. Terminal.
    Unloaded,
    /// An unhandled failure occurred. Recoverable only through reload.
    Error,
}

impl PluginState {
    /// States a plugin may move to from this one.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [PluginState] {
        match self {
            Self::Discovered => &[Self::Loading],
            Self::Loading => &[Self::Loaded, Self::Error],
            Self::Loaded => &[Self::Enabled, Self::Disabled, Self::Unloading, Self::Error],
            Self::Enabled => &[Self::Disabled, Self::Unloading, Self::Error],
            Self::Disabled => &[Self::Enabled, Self::Unloading, Self::Error],
            Self::Unloading => &[Self::Unloaded, Self::Error],
            Self::Unloaded => &[],
            Self::Error => &[Self::Loading, Self::Unloading],
        }
    }

    /// Whether moving to `target` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, target: PluginState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Whether the module is instantiated and holds resources.
    #[must_use]
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Loaded | Self::Enabled | Self::Disabled)
    }

    /// Whether no further transition happens without an explicit reload.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unloaded | Self::Error)
    }

    /// Lowercase name used in logs and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
