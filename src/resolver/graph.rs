// src/resolver/graph.rs

//! The resolved dependency tree
//!
//! Nodes are keyed by canonical artifact reference. Edges point from an
//! artifact to the artifacts its translated dependencies resolved to, in
//! declaration order. Cycles are allowed; traversals visit each node once.

use super::NodeState;
use crate::artifact::ArtifactReference;
use crate::error::Result;
use crate::wheel::ConvertedArtifact;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One reference touched during resolution
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub reference: ArtifactReference,
    pub state: NodeState,
}

/// A dependency or reference dropped from the tree, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    /// Dependency name or canonical reference
    pub subject: String,
    pub reason: String,
}

/// Outcome of one resolution run
#[derive(Debug, Default)]
pub struct ResolvedTree {
    pub(crate) roots: Vec<String>,
    pub(crate) nodes: BTreeMap<String, ResolvedNode>,
    pub(crate) edges: BTreeMap<String, Vec<String>>,
    reverse_edges: BTreeMap<String, Vec<String>>,
    pub(crate) failures: Vec<ResolutionFailure>,
}

impl ResolvedTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, key: String, node: ResolvedNode) {
        self.nodes.insert(key, node);
    }

    /// Add a dependency edge; duplicates are ignored
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let targets = self.edges.entry(from.to_string()).or_default();
        if targets.iter().any(|t| t == to) {
            return;
        }
        targets.push(to.to_string());
        self.reverse_edges
            .entry(to.to_string())
            .or_default()
            .push(from.to_string());
    }

    pub fn add_root(&mut self, key: String) {
        if !self.roots.contains(&key) {
            self.roots.push(key);
        }
    }

    pub fn add_failure(&mut self, failure: ResolutionFailure) {
        self.failures.push(failure);
    }

    /// Canonical keys of the root artifacts, in request order
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// The first root's artifact
    pub fn root(&self) -> Option<&Arc<ConvertedArtifact>> {
        self.roots.first().and_then(|key| self.artifact(key))
    }

    /// Every reference touched, keyed canonically
    pub fn nodes(&self) -> &BTreeMap<String, ResolvedNode> {
        &self.nodes
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedNode> {
        self.nodes.get(key)
    }

    pub fn artifact(&self, key: &str) -> Option<&Arc<ConvertedArtifact>> {
        match self.nodes.get(key).map(|n| &n.state) {
            Some(NodeState::Done(artifact)) => Some(artifact),
            _ => None,
        }
    }

    /// Completed artifacts in key order
    pub fn artifacts(&self) -> impl Iterator<Item = (&String, &Arc<ConvertedArtifact>)> {
        self.nodes.iter().filter_map(|(key, node)| match &node.state {
            NodeState::Done(artifact) => Some((key, artifact)),
            _ => None,
        })
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, key: &str) -> &[String] {
        self.edges.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Nodes that depend on this one
    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.reverse_edges.get(key).cloned().unwrap_or_default()
    }

    pub fn failures(&self) -> &[ResolutionFailure] {
        &self.failures
    }

    /// Completed nodes reachable from `starts`, dependencies before dependents
    ///
    /// Each start comes after everything it reaches. Back edges of a cycle
    /// are skipped.
    pub fn post_order(&self, starts: &[String]) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for start in starts {
            self.dfs_post_order(start, &mut visited, &mut order);
        }
        order
    }

    fn dfs_post_order(&self, key: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(key.to_string()) {
            return;
        }
        for child in self.dependencies(key) {
            self.dfs_post_order(child, visited, order);
        }
        if self.artifact(key).is_some() {
            order.push(key.to_string());
        }
    }

    /// First dependency cycle reachable in the tree
    ///
    /// The path starts and ends on the same reference, e.g. `[x, y, x]`.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut finished = HashSet::new();
        let mut path = Vec::new();
        self.nodes
            .keys()
            .find_map(|key| self.cycle_through(key, &mut path, &mut finished))
    }

    fn cycle_through<'a>(
        &'a self,
        key: &'a str,
        path: &mut Vec<&'a str>,
        finished: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|k| *k == key) {
            let mut cycle: Vec<String> = path[start..].iter().map(|k| k.to_string()).collect();
            cycle.push(key.to_string());
            return Some(cycle);
        }
        if finished.contains(key) {
            return None;
        }

        path.push(key);
        for child in self.dependencies(key) {
            if let Some(cycle) = self.cycle_through(child, path, finished) {
                return Some(cycle);
            }
        }
        path.pop();
        finished.insert(key);
        None
    }

    /// Release every produced artifact
    ///
    /// All artifacts are attempted; the first error is returned.
    pub fn release(&self) -> Result<()> {
        let mut first_error = None;
        for (key, artifact) in self.artifacts() {
            if let Err(e) = artifact.release() {
                warn!("Failed to release {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> TreeStats {
        let completed = self.artifacts().count();
        let cycles = self
            .nodes
            .values()
            .filter(|n| matches!(n.state, NodeState::Cycle))
            .count();
        TreeStats {
            total_references: self.nodes.len(),
            completed,
            cycles,
            dependencies: self.edges.values().map(Vec::len).sum(),
            failures: self.failures.len(),
        }
    }
}

/// Summary counts of a resolved tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub total_references: usize,
    pub completed: usize,
    /// References still tombstoned as cycle entries
    pub cycles: usize,
    pub dependencies: usize,
    pub failures: usize,
}
