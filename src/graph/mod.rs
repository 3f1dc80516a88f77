//! Resource dependency graph.
//!
//! Nodes live in a flat array indexed by declaration order; edges are
//! `(dependent, dependency)` index pairs. A [`ResourceGraph`] can only be
//! obtained through [`GraphBuilder`], which guarantees it is acyclic and has
//! no dangling edges.

mod builder;

pub use builder::GraphBuilder;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;

use crate::config::{ResourceKey, ResourceSpec};

/// An acyclic graph of declared resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceSpec>,
    edges: Vec<(usize, usize)>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
}

impl ResourceGraph {
    /// An empty graph, the desired state of `destroy`.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceSpec] {
        &self.nodes
    }

    /// The node at `index`.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&ResourceSpec> {
        self.nodes.get(index)
    }

    /// All `(dependent, dependency)` edges, sorted and deduplicated.
    #[must_use]
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Index of the node with the given logical name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of the node with the given identity.
    #[must_use]
    pub fn index_of_key(&self, key: &ResourceKey) -> Option<usize> {
        self.index_of(&key.name)
            .filter(|&i| self.nodes[i].kind == key.kind)
    }

    /// Direct dependencies of a node, ascending.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.dependencies.get(index).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of a node, ascending.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map_or(&[], Vec::as_slice)
    }

    /// Deterministic topological order, dependencies first.
    ///
    /// Among nodes that are ready at the same time, the one declared first
    /// goes first.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|&(_, n)| *n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }

    /// Nodes grouped by the length of their longest dependency chain.
    ///
    /// Nodes within a level have no dependency on each other.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut level = vec![0usize; self.nodes.len()];
        for node in self.topological_order() {
            level[node] = self.dependencies[node]
                .iter()
                .map(|&d| level[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut levels = vec![Vec::new(); depth];
        for (node, &l) in level.iter().enumerate() {
            levels[l].push(node);
        }
        levels
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self, title: &str) -> String {
        let mut out = String::new();
        out.push_str("digraph halldyll {\n");
        let _ = writeln!(out, "  label=\"{title}\";");
        out.push_str("  labelloc=t;\n");
        out.push_str("  rankdir=LR;\n");

        for node in &self.nodes {
            let _ = writeln!(out, "  \"{}\";", node.key());
        }
        for &(dependent, dependency) in &self.edges {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\";",
                self.nodes[dependency].key(),
                self.nodes[dependent].key()
            );
        }

        for level in self.levels() {
            if level.len() > 1 {
                out.push_str("  { rank=same; ");
                for i in level {
                    let _ = write!(out, "\"{}\"; ", self.nodes[i].key());
                }
                out.push_str("}\n");
            }
        }

        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> ResourceGraph {
        GraphBuilder::new()
            .build(vec![
                ResourceSpec::new("vm", "vm").with_reference("nic", "nic.id"),
                ResourceSpec::new("nic", "nic")
                    .with_reference("subnet", "subnet.id")
                    .with_dependency("nsg"),
                ResourceSpec::new("nsg", "nsg").with_reference("rg", "rg.name"),
                ResourceSpec::new("subnet", "subnet").with_reference("rg", "rg.name"),
                ResourceSpec::new("rg", "rg"),
            ])
            .unwrap()
    }

    #[test]
    fn test_topological_order_dependencies_first() {
        let graph = diamond();
        let order = graph.topological_order();
        let names: Vec<_> = order.iter().map(|&i| graph.nodes()[i].name.as_str()).collect();
        assert_eq!(names, vec!["rg", "nsg", "subnet", "nic", "vm"]);
    }

    #[test]
    fn test_levels() {
        let graph = diamond();
        let levels = graph.levels();
        assert_eq!(levels, vec![vec![4], vec![2, 3], vec![1], vec![0]]);
    }

    #[test]
    fn test_neighbours() {
        let graph = diamond();
        let nic = graph.index_of("nic").unwrap();
        assert_eq!(graph.dependencies(nic), &[2, 3]);
        assert_eq!(graph.dependents(nic), &[0]);
        assert!(graph.index_of_key(&ResourceKey::new("nic", "nic")).is_some());
        assert!(graph.index_of_key(&ResourceKey::new("vm", "nic")).is_none());
    }

    #[test]
    fn test_dot_output() {
        let graph = diamond();
        let dot = graph.to_dot("demo");
        assert!(dot.starts_with("digraph halldyll {"));
        assert!(dot.contains("\"rg.rg\" -> \"subnet.subnet\";"));
        assert!(dot.contains("rank=same"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = ResourceGraph::empty();
        assert!(graph.is_empty());
        assert!(graph.topological_order().is_empty());
        assert!(graph.levels().is_empty());
    }
}
