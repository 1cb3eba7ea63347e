//! In-memory dependency graph.

use crate::{CheckOptions, DepsError, Result, Version};
use std::collections::{BTreeMap, BTreeSet};
use tether_types::{DependencyKind, PluginId, PluginManifest};

/// One declared relationship from a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub target: PluginId,
    pub kind: DependencyKind,
    pub version_range: Option<String>,
}

/// A registered plugin and its outgoing edges in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginNode {
    pub id: PluginId,
    pub version: Version,
    pub edges: Vec<DependencyEdge>,
}

impl PluginNode {
    pub fn from_manifest(manifest: &PluginManifest) -> Result<Self> {
        let version = Version::parse(&manifest.version)?;
        let edges = manifest
            .dependencies
            .iter()
            .map(|dep| DependencyEdge {
                target: dep.id.clone(),
                kind: dep.effective_kind(),
                version_range: dep.version_range.clone(),
            })
            .collect();
        Ok(Self {
            id: manifest.id.clone(),
            version,
            edges,
        })
    }

    /// Non-conflict edges the options admit.
    pub fn eligible_edges<'a>(
        &'a self,
        options: &'a CheckOptions,
    ) -> impl Iterator<Item = &'a DependencyEdge> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.kind.is_traversable() && options.admits(e.kind))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<PluginId, PluginNode>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: PluginNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(DepsError::AlreadyRegistered(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn remove(&mut self, id: &PluginId) -> Option<PluginNode> {
        self.nodes.remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<&PluginNode> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &PluginId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PluginNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first preorder of everything reachable from `start` over
    /// eligible edges, excluding `start`. Unregistered targets are listed
    /// but not expanded.
    #[must_use]
    pub fn reachable_from(&self, start: &PluginId, options: &CheckOptions) -> Vec<PluginId> {
        let mut seen = BTreeSet::from([start.clone()]);
        let mut found = Vec::new();
        self.collect_reachable(start, options, &mut seen, &mut found);
        found
    }

    fn collect_reachable(
        &self,
        id: &PluginId,
        options: &CheckOptions,
        seen: &mut BTreeSet<PluginId>,
        found: &mut Vec<PluginId>,
    ) {
        let Some(node) = self.nodes.get(id) else { return };
        for edge in node.eligible_edges(options) {
            if seen.insert(edge.target.clone()) {
                found.push(edge.target.clone());
                self.collect_reachable(&edge.target, options, seen, found);
            }
        }
    }

    /// Depth-first search for a cycle reachable from `start`. Returns the
    /// path from the first occurrence of the repeated node to the repeat.
    #[must_use]
    pub fn find_cycle(&self, start: &PluginId, options: &CheckOptions) -> Option<Vec<PluginId>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        self.visit(start, options, &mut visited, &mut path)
    }

    fn visit(
        &self,
        id: &PluginId,
        options: &CheckOptions,
        visited: &mut BTreeSet<PluginId>,
        path: &mut Vec<PluginId>,
    ) -> Option<Vec<PluginId>> {
        if let Some(pos) = path.iter().position(|p| p == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id.clone());
            return Some(cycle);
        }
        if !visited.insert(id.clone()) {
            return None;
        }

        let node = self.nodes.get(id)?;
        path.push(id.clone());
        for edge in node.eligible_edges(options) {
            if let Some(cycle) = self.visit(&edge.target, options, visited, path) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::DependencySpec;

    fn node(id: &str, deps: &[&str]) -> PluginNode {
        let manifest = deps.iter().fold(PluginManifest::new(id, id, "1.0.0"), |m, d| {
            m.with_dependency(DependencySpec::required(*d, None))
        });
        PluginNode::from_manifest(&manifest).unwrap()
    }

    #[test]
    fn finds_cycle_path_from_first_occurrence() {
        let mut graph = DependencyGraph::new();
        graph.insert(node("root", &["a"])).unwrap();
        graph.insert(node("a", &["b"])).unwrap();
        graph.insert(node("b", &["a"])).unwrap();

        let cycle = graph
            .find_cycle(&PluginId::new("root"), &CheckOptions::default())
            .unwrap();
        let names: Vec<_> = cycle.iter().map(PluginId::as_str).collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.insert(node("top", &["l", "r"])).unwrap();
        graph.insert(node("l", &["base"])).unwrap();
        graph.insert(node("r", &["base"])).unwrap();
        graph.insert(node("base", &[])).unwrap();

        assert!(graph
            .find_cycle(&PluginId::new("top"), &CheckOptions::default())
            .is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut graph = DependencyGraph::new();
        graph.insert(node("a", &[])).unwrap();
        assert!(matches!(
            graph.insert(node("a", &[])),
            Err(DepsError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn unparsable_version_is_rejected() {
        let manifest = PluginManifest::new("a", "A", "one");
        assert!(matches!(
            PluginNode::from_manifest(&manifest),
            Err(DepsError::InvalidVersion(_))
        ));
    }
}
