//! Manifest validation.
//!
//! Validation never fails outright: every problem is collected into a
//! [`ValidationReport`] and the caller decides whether to abort.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::manifest::{Dependency, Permission, PluginManifest};
use crate::plugin::PluginId;
use crate::version::{VersionConstraint, is_valid_version, parse_version};

/// Outcome of validating a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// `true` iff `errors` is empty.
    pub valid: bool,
    /// Problems that prevent loading.
    pub errors: Vec<String>,
    /// Problems worth surfacing that do not prevent loading.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Convert a failed report into [`PluginError::Validation`].
    ///
    /// # Errors
    ///
    /// Returns the validation error when the report is not valid.
    pub fn into_result(self) -> Result<Vec<String>, PluginError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(PluginError::Validation {
                errors: self.errors,
            })
        }
    }
}

/// Stateless manifest checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestValidator;

impl ManifestValidator {
    /// Check a manifest and report every error and warning found.
    #[must_use]
    pub fn validate(manifest: &PluginManifest) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (field, value) in [
            ("id", &manifest.id),
            ("name", &manifest.name),
            ("version", &manifest.version),
            ("author", &manifest.author),
            ("main", &manifest.main),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{field} is required"));
            }
        }

        if !manifest.id.is_empty() {
            if let Err(e) = PluginId::new(manifest.id.clone()) {
                errors.push(e.to_string());
            }
        }

        if !manifest.version.is_empty() && !is_valid_version(&manifest.version) {
            errors.push(format!(
                "version '{}' must match MAJOR.MINOR.PATCH[-prerelease]",
                manifest.version
            ));
        }

        if manifest.description.as_deref().is_none_or(|d| d.trim().is_empty()) {
            warnings.push("description is missing".to_string());
        }

        check_dependencies("dependencies", &manifest.dependencies, &mut errors, &mut warnings);
        check_dependencies(
            "peer_dependencies",
            &manifest.peer_dependencies,
            &mut errors,
            &mut warnings,
        );

        for permission in &manifest.permissions {
            if Permission::parse(permission).is_none() {
                warnings.push(format!("unknown permission '{permission}'"));
            }
        }

        check_host_bounds(manifest, &mut errors);

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

fn check_dependencies(
    field: &str,
    deps: &[Dependency],
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for dep in deps {
        if dep.name.trim().is_empty() {
            errors.push(format!("{field}: dependency name is required"));
            continue;
        }
        if !seen.insert(dep.name.as_str()) {
            errors.push(format!("{field}: duplicate dependency '{}'", dep.name));
        }
        if dep.version.trim().is_empty() {
            warnings.push(format!(
                "{field}: dependency '{}' has no version constraint",
                dep.name
            ));
        } else if let Err(e) = VersionConstraint::parse(&dep.version) {
            errors.push(format!(
                "{field}: invalid constraint for '{}': {e}",
                dep.name
            ));
        }
    }
}

fn check_host_bounds(manifest: &PluginManifest, errors: &mut Vec<String>) {
    let min = manifest
        .min_host_version
        .as_deref()
        .map(|v| parse_version(v).map_err(|e| format!("min_host_version: {e}")));
    let max = manifest
        .max_host_version
        .as_deref()
        .map(|v| parse_version(v).map_err(|e| format!("max_host_version: {e}")));

    match (min, max) {
        (Some(Ok(min)), Some(Ok(max))) if min > max => errors.push(format!(
            "min_host_version {min} is greater than max_host_version {max}"
        )),
        (min, max) => {
            for bound in [min, max].into_iter().flatten() {
                if let Err(e) = bound {
                    errors.push(e);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manifest() -> PluginManifest {
        let mut m = PluginManifest::new("echo", "Echo", "1.0.0", "Katbot Team", "echo.toml");
        m.description = Some("Repeats things".into());
        m
    }

    #[test]
    fn test_valid_manifest_has_no_errors() {
        let report = ManifestValidator::validate(&valid_manifest());
        assert!(report.valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_required_fields() {
        let report = ManifestValidator::validate(&PluginManifest::new("", "", "", "", ""));
        assert!(!report.valid);
        for field in ["id", "name", "version", "author", "main"] {
            assert!(
                report.errors.contains(&format!("{field} is required")),
                "missing error for {field}: {:?}",
                report.errors
            );
        }
    }

    #[test]
    fn test_bad_version_is_an_error_entry() {
        let mut m = valid_manifest();
        m.version = "1.0".into();
        let report = ManifestValidator::validate(&m);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("MAJOR.MINOR.PATCH"));

        m.version = "2.0.0-rc.1".into();
        assert!(ManifestValidator::validate(&m).valid);
    }

    #[test]
    fn test_missing_constraint_is_a_warning() {
        let mut m = valid_manifest();
        m.dependencies.push(Dependency::required("storage", ""));
        let report = ManifestValidator::validate(&m);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("no version constraint"));
    }

    #[test]
    fn test_dependency_errors() {
        let mut m = valid_manifest();
        m.dependencies.push(Dependency::required("storage", "^1.0.0"));
        m.dependencies.push(Dependency::required("storage", "^1.1.0"));
        m.dependencies.push(Dependency::required("net", "^one"));
        let report = ManifestValidator::validate(&m);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate dependency 'storage'")));
        assert!(report.errors.iter().any(|e| e.contains("invalid constraint for 'net'")));
    }

    #[test]
    fn test_invalid_id_and_unknown_permission() {
        let mut m = valid_manifest();
        m.id = "../escape".into();
        m.permissions = vec!["network".into(), "mind-control".into()];
        let report = ManifestValidator::validate(&m);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("invalid plugin id")));
        assert_eq!(report.warnings, vec!["unknown permission 'mind-control'".to_string()]);
    }

    #[test]
    fn test_host_bounds() {
        let mut m = valid_manifest();
        m.min_host_version = Some("2.0.0".into());
        m.max_host_version = Some("1.0.0".into());
        let report = ManifestValidator::validate(&m);
        assert!(report.errors.iter().any(|e| e.contains("greater than")));

        m.max_host_version = Some("latest".into());
        let report = ManifestValidator::validate(&m);
        assert!(report.errors.iter().any(|e| e.starts_with("max_host_version")));
    }

    #[test]
    fn test_into_result() {
        let report = ManifestValidator::validate(&PluginManifest::new("", "n", "1.0.0", "a", "m"));
        let err = report.into_result().unwrap_err();
        assert!(err.is_validation());
    }
}
