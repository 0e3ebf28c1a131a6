//! Dependency graph resolution.
//!
//! Builds the dependency graph restricted to the transitive closure of one
//! plugin, checks every edge against its version constraint and computes a
//! dependencies-first load order with a depth-first topological sort.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::manifest::{Dependency, PluginManifest};
use crate::version::{VersionConstraint, parse_version};

/// Outcome of resolving one plugin's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// `true` iff `missing` and `conflicts` are both empty.
    pub resolved: bool,
    /// Required dependencies that are not known.
    pub missing: Vec<String>,
    /// Constraint mismatches and dependency cycles.
    pub conflicts: Vec<String>,
    /// Dependencies first, the resolved plugin last. Empty on a cycle.
    pub load_order: Vec<String>,
    /// Non-blocking observations such as absent peers.
    pub warnings: Vec<String>,
}

/// Resolves dependency graphs against a set of known manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Resolve `manifest` against `known` plugins keyed by id.
    ///
    /// `manifest` takes precedence over a known manifest with the same id.
    #[must_use]
    pub fn resolve(manifest: &PluginManifest, known: &HashMap<String, PluginManifest>) -> Resolution {
        let nodes = closure(manifest, known);
        let mut missing = BTreeSet::new();
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        let mut ids: Vec<&str> = nodes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let node = nodes[id];
            for dep in &node.dependencies {
                match nodes.get(dep.name.as_str()) {
                    None if dep.optional => {
                        debug!(plugin_id = %id, dependency = %dep.name, "Optional dependency absent");
                    },
                    None => {
                        missing.insert(dep.name.clone());
                    },
                    Some(target) => {
                        if let Some(conflict) = check_edge(id, dep, target) {
                            conflicts.push(conflict);
                        }
                    },
                }
            }
        }

        for peer in &manifest.peer_dependencies {
            match nodes.get(peer.name.as_str()).copied().or_else(|| known.get(&peer.name)) {
                None => warnings.push(format!(
                    "peer dependency '{}' of {} is not installed",
                    peer.name, manifest.id
                )),
                Some(target) => {
                    if let Some(conflict) = check_edge(&manifest.id, peer, target) {
                        conflicts.push(conflict);
                    }
                },
            }
        }

        let load_order = match topological_order(&nodes, [manifest.id.as_str()]) {
            Ok(order) => order,
            Err(cycle) => {
                conflicts.push(format!("circular dependency: {}", cycle.join(" -> ")));
                Vec::new()
            },
        };

        let missing: Vec<String> = missing.into_iter().collect();
        Resolution {
            resolved: missing.is_empty() && conflicts.is_empty(),
            missing,
            conflicts,
            load_order,
            warnings,
        }
    }

    /// Order a whole set of manifests dependencies-first.
    ///
    /// Dependencies outside the set are ignored. Ties are broken by id so the
    /// order is stable.
    ///
    /// # Errors
    ///
    /// Returns the cycle path if the set contains a dependency cycle.
    pub fn order_all(manifests: &HashMap<String, PluginManifest>) -> Result<Vec<String>, Vec<String>> {
        let nodes: HashMap<&str, &PluginManifest> =
            manifests.iter().map(|(id, m)| (id.as_str(), m)).collect();
        let mut roots: Vec<&str> = nodes.keys().copied().collect();
        roots.sort_unstable();
        topological_order(&nodes, roots)
    }
}

/// Collect `root` and every known plugin reachable through its dependencies.
fn closure<'a>(
    root: &'a PluginManifest,
    known: &'a HashMap<String, PluginManifest>,
) -> HashMap<&'a str, &'a PluginManifest> {
    let mut nodes: HashMap<&str, &PluginManifest> = HashMap::new();
    nodes.insert(root.id.as_str(), root);
    let mut queue = vec![root];
    while let Some(node) = queue.pop() {
        for dep in &node.dependencies {
            if nodes.contains_key(dep.name.as_str()) {
                continue;
            }
            if let Some(target) = known.get(&dep.name) {
                nodes.insert(dep.name.as_str(), target);
                queue.push(target);
            }
        }
    }
    nodes
}

fn check_edge(from: &str, dep: &Dependency, target: &PluginManifest) -> Option<String> {
    let constraint = match VersionConstraint::parse(&dep.version) {
        Ok(c) => c,
        Err(e) => return Some(format!("{from} -> {}: {e}", dep.name)),
    };
    let version = match parse_version(&target.version) {
        Ok(v) => v,
        Err(e) => return Some(format!("{from} -> {}: {e}", dep.name)),
    };
    if constraint.matches(&version) {
        None
    } else {
        Some(format!(
            "{from} requires {} {constraint}, found {version}",
            dep.name
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Post-order DFS over present dependency edges.
fn topological_order<'a>(
    nodes: &HashMap<&'a str, &'a PluginManifest>,
    roots: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<String>, Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut order = Vec::new();
    for root in roots {
        visit(root, nodes, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    id: &'a str,
    nodes: &HashMap<&'a str, &'a PluginManifest>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<(), Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::OnStack) => {
            let start = stack.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Err(cycle);
        },
        None => {},
    }
    let Some(&node) = nodes.get(id) else {
        return Ok(());
    };

    marks.insert(id, Mark::OnStack);
    stack.push(id);
    let mut seen = HashSet::new();
    for dep in &node.dependencies {
        if seen.insert(dep.name.as_str()) && nodes.contains_key(dep.name.as_str()) {
            visit(dep.name.as_str(), nodes, marks, stack, order)?;
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    order.push(id.to_string());
    Ok(())
}
