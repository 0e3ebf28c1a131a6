//! Semantic versions, dependency constraints and the host version provider.
//!
//! Versions follow the `MAJOR.MINOR.PATCH[-prerelease]` grammar (no build
//! metadata). Constraints support `^`, `~`, `>=`, `<=`, exact (optionally
//! `=`-prefixed) and `*` / empty for "any version".

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
pub use semver::Version;
use serde::{Deserialize, Serialize};

static VERSION_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?$")
        .unwrap_or_else(|e| unreachable!("static version grammar: {e}"))
});

/// Whether `s` matches the strict `MAJOR.MINOR.PATCH[-prerelease]` grammar.
#[must_use]
pub fn is_valid_version(s: &str) -> bool {
    VERSION_GRAMMAR.is_match(s)
}

/// Parse a version string against the strict grammar.
///
/// # Errors
///
/// Returns a description of the problem if `s` is not a valid version.
pub fn parse_version(s: &str) -> Result<Version, String> {
    let s = s.trim();
    if !is_valid_version(s) {
        return Err(format!(
            "'{s}' is not a valid version (expected MAJOR.MINOR.PATCH[-prerelease])"
        ));
    }
    Version::parse(s).map_err(|e| format!("'{s}': {e}"))
}

/// Parse a version inside a constraint, padding `1` and `1.2` to full triples.
fn parse_constraint_version(s: &str) -> Result<Version, String> {
    let s = s.trim();
    let padded = match s.split('-').next().map(|core| core.matches('.').count()) {
        Some(0) => format!("{s}.0.0"),
        Some(1) => format!("{s}.0"),
        _ => s.to_string(),
    };
    parse_version(&padded)
}

fn triple(v: &Version) -> (u64, u64, u64) {
    (v.major, v.minor, v.patch)
}

/// A dependency version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `*` or an empty string.
    Any,
    /// `^X.Y.Z`: same major, at least the required version.
    Caret(Version),
    /// `~X.Y.Z`: same major and minor, patch at least the required one.
    Tilde(Version),
    /// `>=X.Y.Z`.
    AtLeast(Version),
    /// `<=X.Y.Z`.
    AtMost(Version),
    /// `X.Y.Z` or `=X.Y.Z`.
    Exact(Version),
}

impl VersionConstraint {
    /// Parse a constraint string.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the version part is invalid.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::Any);
        }
        if let Some(rest) = s.strip_prefix(">=") {
            return parse_constraint_version(rest).map(Self::AtLeast);
        }
        if let Some(rest) = s.strip_prefix("<=") {
            return parse_constraint_version(rest).map(Self::AtMost);
        }
        if let Some(rest) = s.strip_prefix('^') {
            return parse_constraint_version(rest).map(Self::Caret);
        }
        if let Some(rest) = s.strip_prefix('~') {
            return parse_constraint_version(rest).map(Self::Tilde);
        }
        let rest = s.strip_prefix('=').unwrap_or(s);
        parse_constraint_version(rest).map(Self::Exact)
    }

    /// Whether `version` satisfies this constraint.
    ///
    /// `>=` and `<=` compare `(major, minor, patch)` triples only; exact
    /// matches also compare the prerelease tag.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Caret(req) => version.major == req.major && triple(version) >= triple(req),
            Self::Tilde(req) => {
                version.major == req.major
                    && version.minor == req.minor
                    && version.patch >= req.patch
            },
            Self::AtLeast(req) => triple(version) >= triple(req),
            Self::AtMost(req) => triple(version) <= triple(req),
            Self::Exact(req) => version == req,
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Caret(v) => write!(f, "^{v}"),
            Self::Tilde(v) => write!(f, "~{v}"),
            Self::AtLeast(v) => write!(f, ">={v}"),
            Self::AtMost(v) => write!(f, "<={v}"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Supplies the running host's version for compatibility checks.
pub trait HostVersionProvider: Send + Sync {
    /// The current host version.
    fn host_version(&self) -> Version;
}

/// A fixed host version, typically read from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHostVersion(Version);

impl StaticHostVersion {
    /// Wrap a known version.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self(version)
    }

    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if `s` is not a valid version.
    pub fn parse(s: &str) -> Result<Self, String> {
        parse_version(s).map(Self)
    }
}

impl Default for StaticHostVersion {
    /// The version of this crate, as in the default `host_version` setting.
    fn default() -> Self {
        Self(Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0)))
    }
}

impl HostVersionProvider for StaticHostVersion {
    fn host_version(&self) -> Version {
        self.0.clone()
    }
}

/// Outcome of checking a version against optional min/max bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    /// Whether the version is within bounds.
    pub compatible: bool,
    /// Why not, when incompatible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Compatibility {
    /// Check `version` against inclusive `min` / `max` bounds given as strings.
    ///
    /// Unparseable bounds make the result incompatible rather than silently
    /// passing.
    #[must_use]
    pub fn check(version: &Version, min: Option<&str>, max: Option<&str>) -> Self {
        if let Some(min) = min {
            match parse_version(min) {
                Ok(min_v) if triple(version) < triple(&min_v) => {
                    return Self::incompatible(format!("requires host >= {min_v}, found {version}"));
                },
                Ok(_) => {},
                Err(e) => return Self::incompatible(format!("invalid minimum host version: {e}")),
            }
        }
        if let Some(max) = max {
            match parse_version(max) {
                Ok(max_v) if triple(version) > triple(&max_v) => {
                    return Self::incompatible(format!("requires host <= {max_v}, found {version}"));
                },
                Ok(_) => {},
                Err(e) => return Self::incompatible(format!("invalid maximum host version: {e}")),
            }
        }
        Self {
            compatible: true,
            reason: None,
        }
    }

    fn incompatible(reason: String) -> Self {
        Self {
            compatible: false,
            reason: Some(reason),
        }
    }
}
