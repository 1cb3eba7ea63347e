//! Dependency resolution over the registered plugin set.

use crate::graph::{DependencyEdge, DependencyGraph, PluginNode};
use crate::report::{
    DependencyConflict, DependencyReport, SatisfiedDependency, UnsatisfiedDependency,
    UnsatisfiedReason,
};
use crate::{DepsError, FetchedPackage, PluginMarket, Result, UpdateInfo, Version, VersionRange};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_types::{DependencyKind, PluginId, PluginManifest};
use tracing::{debug, info, warn};

/// Knobs for [`DependencyResolver::check_dependencies`]. Doubles as the
/// `[dependencies]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    pub ignore_optional: bool,
    pub ignore_recommends: bool,
    pub ignore_enhances: bool,
    pub check_conflicts: bool,
    pub auto_install: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            ignore_optional: false,
            ignore_recommends: false,
            ignore_enhances: false,
            check_conflicts: true,
            auto_install: false,
        }
    }
}

impl CheckOptions {
    /// Returns true if edges of this kind take part in a check.
    #[must_use]
    pub fn admits(&self, kind: DependencyKind) -> bool {
        match kind {
            DependencyKind::Required => true,
            DependencyKind::Optional => !self.ignore_optional,
            DependencyKind::Recommends => !self.ignore_recommends,
            DependencyKind::Enhances => !self.ignore_enhances,
            DependencyKind::Conflicts => self.check_conflicts,
        }
    }
}

/// Tracks registered plugins and answers dependency questions about them.
pub struct DependencyResolver {
    graph: Mutex<DependencyGraph>,
    market: Option<Arc<dyn PluginMarket>>,
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("plugins", &self.graph().len())
            .field("market", &self.market.is_some())
            .finish()
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(DependencyGraph::new()),
            market: None,
        }
    }

    #[must_use]
    pub fn with_market(market: Arc<dyn PluginMarket>) -> Self {
        Self {
            graph: Mutex::new(DependencyGraph::new()),
            market: Some(market),
        }
    }

    fn graph(&self) -> MutexGuard<'_, DependencyGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_plugin(&self, manifest: &PluginManifest) -> Result<()> {
        let node = PluginNode::from_manifest(manifest)?;
        let edges = node.edges.len();
        self.graph().insert(node)?;
        debug!(plugin_id = %manifest.id, version = %manifest.version, edges, "Plugin added to dependency graph");
        Ok(())
    }

    /// Returns true if the plugin was registered.
    pub fn unregister_plugin(&self, id: &PluginId) -> bool {
        let removed = self.graph().remove(id).is_some();
        if removed {
            debug!(plugin_id = %id, "Plugin removed from dependency graph");
        }
        removed
    }

    #[must_use]
    pub fn is_registered(&self, id: &PluginId) -> bool {
        self.graph().contains(id)
    }

    #[must_use]
    pub fn installed_version(&self, id: &PluginId) -> Option<Version> {
        self.graph().get(id).map(|n| n.version.clone())
    }

    /// Checks a registered plugin's direct dependencies and conflicts.
    ///
    /// A cycle reachable from the plugin fails the check immediately; the
    /// report then carries only the cycle path. With `auto_install`, missing
    /// REQUIRED and OPTIONAL dependencies are fetched from the market.
    pub async fn check_dependencies(
        &self,
        plugin_id: &PluginId,
        options: &CheckOptions,
    ) -> Result<DependencyReport> {
        let mut report = {
            let graph = self.graph();
            let node = graph
                .get(plugin_id)
                .ok_or_else(|| DepsError::NotRegistered(plugin_id.clone()))?;

            if let Some(path) = graph.find_cycle(plugin_id, options) {
                let report = DependencyReport::cyclic(plugin_id.clone(), path);
                warn!(plugin_id = %plugin_id, error = ?report.error_message, "Dependency cycle");
                return Ok(report);
            }
            evaluate(&graph, node, options)
        };

        if options.auto_install {
            self.auto_install(&mut report).await;
        }

        report.success = report.unsatisfied.is_empty() && report.conflicts.is_empty();
        report.error_message = report.failure().map(|e| e.to_string());
        debug!(
            plugin_id = %plugin_id,
            success = report.success,
            satisfied = report.satisfied.len(),
            unsatisfied = report.unsatisfied.len(),
            conflicts = report.conflicts.len(),
            "Dependency check finished"
        );
        Ok(report)
    }

    async fn auto_install(&self, report: &mut DependencyReport) {
        let Some(market) = self.market.clone() else {
            debug!("Auto-install requested without a plugin market");
            return;
        };

        let candidates: Vec<UnsatisfiedDependency> = report
            .unsatisfied
            .iter()
            .chain(&report.optional_unsatisfied)
            .filter(|d| {
                d.reason == UnsatisfiedReason::Missing
                    && matches!(d.kind, DependencyKind::Required | DependencyKind::Optional)
            })
            .cloned()
            .collect();

        for dep in candidates {
            let fetched = match fetch_from_market(market.as_ref(), &dep).await {
                Ok(Some(fetched)) => fetched,
                Ok(None) => {
                    debug!(plugin_id = %dep.plugin_id, "No matching version in market");
                    continue;
                }
                Err(e) => {
                    warn!(plugin_id = %dep.plugin_id, error = %e, "Auto-install failed");
                    continue;
                }
            };

            info!(
                plugin_id = %dep.plugin_id,
                version = %fetched.manifest.version,
                bytes = fetched.bytes.len(),
                "Dependency fetched from market"
            );
            report.unsatisfied.retain(|d| d.plugin_id != dep.plugin_id);
            report.optional_unsatisfied.retain(|d| d.plugin_id != dep.plugin_id);
            report.satisfied.push(SatisfiedDependency {
                plugin_id: dep.plugin_id,
                kind: dep.kind,
                version: fetched.manifest.version.clone(),
                auto_installed: true,
            });
            report.fetched.push(fetched);
        }
    }

    /// Orders `ids` so that dependencies come before their dependents.
    ///
    /// Only edges between members of `ids` count. Ties keep input order.
    /// Repeated ids are collapsed to their first occurrence, so the result
    /// holds each plugin once. If the subset contains a cycle the
    /// de-duplicated input is returned as given.
    #[must_use]
    pub fn get_installation_order(&self, ids: &[PluginId]) -> Vec<PluginId> {
        let mut unique: Vec<&PluginId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        let index: BTreeMap<&PluginId, usize> =
            unique.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut waiting_on = vec![0usize; unique.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); unique.len()];
        {
            let graph = self.graph();
            for (i, id) in unique.iter().enumerate() {
                let Some(node) = graph.get(id) else { continue };
                let mut seen = BTreeSet::new();
                for edge in node.edges.iter().filter(|e| e.kind.is_traversable()) {
                    match index.get(&edge.target) {
                        Some(&j) if j != i && seen.insert(j) => {
                            waiting_on[i] += 1;
                            dependents[j].push(i);
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..unique.len()).filter(|&i| waiting_on[i] == 0).collect();
        let mut order = Vec::with_capacity(unique.len());
        while let Some(i) = ready.pop_first() {
            order.push(unique[i].clone());
            for &k in &dependents[i] {
                waiting_on[k] -= 1;
                if waiting_on[k] == 0 {
                    ready.insert(k);
                }
            }
        }

        if order.len() < unique.len() {
            warn!(
                plugins = unique.len(),
                ordered = order.len(),
                "Cycle in installation set, keeping input order"
            );
            return unique.into_iter().cloned().collect();
        }
        order
    }

    /// Everything reachable from `plugin_id` over eligible edges, in
    /// discovery order, excluding the plugin itself.
    #[must_use]
    pub fn get_transitive_dependencies(
        &self,
        plugin_id: &PluginId,
        options: &CheckOptions,
    ) -> Vec<PluginId> {
        self.graph().reachable_from(plugin_id, options)
    }

    /// Registered plugins with a REQUIRED edge to `plugin_id`.
    #[must_use]
    pub fn get_dependents(&self, plugin_id: &PluginId) -> Vec<PluginId> {
        self.graph()
            .nodes()
            .filter(|n| {
                n.edges
                    .iter()
                    .any(|e| e.kind == DependencyKind::Required && e.target == *plugin_id)
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Asks the market whether a newer version of a registered plugin exists.
    pub async fn check_for_update(&self, plugin_id: &PluginId) -> Result<Option<UpdateInfo>> {
        let current = self
            .installed_version(plugin_id)
            .ok_or_else(|| DepsError::NotRegistered(plugin_id.clone()))?;
        let Some(market) = self.market.clone() else {
            return Ok(None);
        };

        let Some(details) = market.get_details(plugin_id).await? else {
            return Ok(None);
        };
        let latest = Version::parse(&details.version)?;
        if latest <= current {
            return Ok(None);
        }
        info!(plugin_id = %plugin_id, %current, %latest, "Update available");
        Ok(Some(UpdateInfo {
            plugin_id: plugin_id.clone(),
            current: current.to_string(),
            latest: latest.to_string(),
        }))
    }
}

/// Evaluates direct edges and conflicts for one node. Auto-install and the
/// success flag are filled in by the caller.
fn evaluate(graph: &DependencyGraph, node: &PluginNode, options: &CheckOptions) -> DependencyReport {
    let mut report = DependencyReport::for_plugin(node.id.clone());

    for edge in &node.edges {
        if edge.kind == DependencyKind::Conflicts || !options.admits(edge.kind) {
            continue;
        }
        match check_edge(graph, edge) {
            Ok(version) => report.satisfied.push(SatisfiedDependency {
                plugin_id: edge.target.clone(),
                kind: edge.kind,
                version,
                auto_installed: false,
            }),
            Err(reason) => {
                let unsatisfied = UnsatisfiedDependency {
                    plugin_id: edge.target.clone(),
                    kind: edge.kind,
                    version_range: edge.version_range.clone(),
                    reason,
                };
                if edge.kind == DependencyKind::Required {
                    report.unsatisfied.push(unsatisfied);
                } else {
                    report.optional_unsatisfied.push(unsatisfied);
                }
            }
        }
    }

    if options.check_conflicts {
        report.conflicts = find_conflicts(graph, node);
    }
    report
}

fn check_edge(graph: &DependencyGraph, edge: &DependencyEdge) -> std::result::Result<String, UnsatisfiedReason> {
    let target = graph.get(&edge.target).ok_or(UnsatisfiedReason::Missing)?;
    let range = VersionRange::parse_opt(edge.version_range.as_deref())
        .map_err(|_| UnsatisfiedReason::InvalidRange(edge.version_range.clone().unwrap_or_default()))?;
    if range.matches(&target.version) {
        Ok(target.version.to_string())
    } else {
        Err(UnsatisfiedReason::VersionMismatch {
            installed: target.version.to_string(),
        })
    }
}

/// Conflicts declared by the node, plus conflicts other registered plugins
/// declare against it.
fn find_conflicts(graph: &DependencyGraph, node: &PluginNode) -> Vec<DependencyConflict> {
    let mut conflicts = Vec::new();

    for edge in node.edges.iter().filter(|e| e.kind == DependencyKind::Conflicts) {
        let Some(other) = graph.get(&edge.target) else { continue };
        if conflict_applies(edge, &other.version) {
            conflicts.push(DependencyConflict {
                plugin_id: other.id.clone(),
                installed_version: other.version.to_string(),
                version_range: edge.version_range.clone(),
            });
        }
    }

    for other in graph.nodes().filter(|n| n.id != node.id) {
        let declared = other
            .edges
            .iter()
            .find(|e| e.kind == DependencyKind::Conflicts && e.target == node.id);
        let Some(edge) = declared else { continue };
        if conflict_applies(edge, &node.version) && !conflicts.iter().any(|c| c.plugin_id == other.id) {
            conflicts.push(DependencyConflict {
                plugin_id: other.id.clone(),
                installed_version: other.version.to_string(),
                version_range: edge.version_range.clone(),
            });
        }
    }
    conflicts
}

fn conflict_applies(edge: &DependencyEdge, version: &Version) -> bool {
    match VersionRange::parse_opt(edge.version_range.as_deref()) {
        Ok(range) => range.matches(version),
        Err(e) => {
            warn!(plugin_id = %edge.target, error = %e, "Ignoring conflict with invalid range");
            false
        }
    }
}

async fn fetch_from_market(
    market: &dyn PluginMarket,
    dep: &UnsatisfiedDependency,
) -> Result<Option<FetchedPackage>> {
    let Some(manifest) = market.get_details(&dep.plugin_id).await? else {
        return Ok(None);
    };
    let version = Version::parse(&manifest.version)?;
    if !VersionRange::parse_opt(dep.version_range.as_deref())?.matches(&version) {
        return Ok(None);
    }
    let bytes = market.get_package(&dep.plugin_id, &manifest.version).await?;
    Ok(Some(FetchedPackage { manifest, bytes }))
}
