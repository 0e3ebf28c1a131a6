//! Static security scan of plugin source text.
//!
//! Runs on load, before any plugin code is instantiated. Critical and high
//! findings block loading; medium and low findings are reported as warnings.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::sandbox::Severity;

struct Rule {
    name: &'static str,
    pattern: Regex,
    severity: Severity,
    remediation: &'static str,
}

fn rule(name: &'static str, pattern: &str, severity: Severity, remediation: &'static str) -> Rule {
    Rule {
        name,
        pattern: Regex::new(pattern).unwrap_or_else(|e| unreachable!("static scan rule {name}: {e}")),
        severity,
        remediation,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "dynamic-eval",
            r"\beval\s*\(",
            Severity::Critical,
            "Remove dynamic code evaluation; dispatch on explicit command names instead.",
        ),
        rule(
            "function-constructor",
            r"\bnew\s+Function\s*\(",
            Severity::High,
            "Do not build functions from strings; define handlers statically.",
        ),
        rule(
            "child-process",
            r#"child_process|std::process::Command|\bspawnSync\s*\(|\bexecSync\s*\("#,
            Severity::Critical,
            "Plugins may not spawn processes; request the capability from the host.",
        ),
        rule(
            "raw-filesystem",
            r#"require\(\s*['"]fs['"]\s*\)|\bfs\.(readFile|writeFile|unlink|rm)|std::fs::"#,
            Severity::High,
            "Use the context's read_file/write_file, which are confined to the plugin directory.",
        ),
        rule(
            "raw-network",
            r#"require\(\s*['"](https?|net)['"]\s*\)|\bfetch\s*\(|XMLHttpRequest|TcpStream::connect"#,
            Severity::Medium,
            "Declare a network permission and authorize hosts through the context.",
        ),
        rule(
            "environment-access",
            r"process\.env|std::env::var",
            Severity::Low,
            "Read settings from plugin configuration instead of the environment.",
        ),
    ]
});

/// One match of a scan rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    /// Rule name, e.g. `dynamic-eval`.
    pub rule: String,
    /// How serious the match is.
    pub severity: Severity,
    /// 1-based line number.
    pub line: usize,
    /// The matched text.
    pub excerpt: String,
    /// Fixed advice for the rule.
    pub remediation: String,
}

impl ScanFinding {
    /// One-line summary used in errors and logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} ({}) at line {}: {}",
            self.rule, self.severity, self.line, self.excerpt
        )
    }
}

/// All findings for one source text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Findings in source order.
    pub findings: Vec<ScanFinding>,
}

impl ScanReport {
    /// Findings that block loading.
    pub fn blocking(&self) -> impl Iterator<Item = &ScanFinding> {
        self.findings.iter().filter(|f| f.severity.is_blocking())
    }

    /// Findings that are only warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &ScanFinding> {
        self.findings.iter().filter(|f| !f.severity.is_blocking())
    }

    /// Whether any finding blocks loading.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocking().next().is_some()
    }
}

/// Scan `source` line by line against every rule.
#[must_use]
pub fn scan_source(source: &str) -> ScanReport {
    let mut findings = Vec::new();
    for (index, line) in source.lines().enumerate() {
        for rule in RULES.iter() {
            if let Some(m) = rule.pattern.find(line) {
                findings.push(ScanFinding {
                    rule: rule.name.to_string(),
                    severity: rule.severity,
                    line: index.saturating_add(1),
                    excerpt: m.as_str().to_string(),
                    remediation: rule.remediation.to_string(),
                });
            }
        }
    }
    ScanReport { findings }
}
