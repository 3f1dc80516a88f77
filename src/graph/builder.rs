//! Graph construction and cycle detection.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::ResourceSpec;
use crate::error::{GraphError, LoadError, Result};

use super::ResourceGraph;

/// DFS visit state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

/// Builds a [`ResourceGraph`] from resource specifications.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph.
    ///
    /// Every reference and every `depends_on` entry becomes an edge from the
    /// declaring resource to its target.
    ///
    /// # Errors
    ///
    /// Returns an error if two specs share a name, if a reference targets an
    /// undeclared resource, or if the dependencies form a cycle.
    pub fn build(&self, specs: Vec<ResourceSpec>) -> Result<ResourceGraph> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if let Some(&first) = index.get(&spec.name) {
                return Err(LoadError::DuplicateName {
                    name: spec.name.clone(),
                    first_kind: specs[first].kind.clone(),
                    second_kind: spec.kind.clone(),
                }
                .into());
            }
            index.insert(spec.name.clone(), i);
        }

        let mut edges = BTreeSet::new();
        for (i, spec) in specs.iter().enumerate() {
            for reference in spec.references() {
                let target = index.get(&reference.target).ok_or_else(|| {
                    GraphError::UnresolvedReference {
                        resource: spec.key().to_string(),
                        reference: reference.to_string(),
                    }
                })?;
                edges.insert((i, *target));
            }
            for name in &spec.depends_on {
                let target = index.get(name).ok_or_else(|| GraphError::UnresolvedReference {
                    resource: spec.key().to_string(),
                    reference: format!("depends_on: {name}"),
                })?;
                edges.insert((i, *target));
            }
        }

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for &(dependent, dependency) in &edges {
            dependencies[dependent].push(dependency);
            dependents[dependency].push(dependent);
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let cycle = cycle.into_iter().map(|i| specs[i].key().to_string()).collect();
            return Err(GraphError::Cycle { cycle }.into());
        }

        debug!(
            "Built resource graph with {} nodes and {} edges",
            specs.len(),
            edges.len()
        );

        Ok(ResourceGraph {
            nodes: specs,
            edges: edges.into_iter().collect(),
            dependencies,
            dependents,
            index,
        })
    }
}

/// Iterative depth-first search over dependency edges.
///
/// Returns the members of the first cycle found, in edge order starting at
/// the node where the cycle was entered.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut state = vec![Visit::Unvisited; dependencies.len()];
    // (node, index of the next dependency to explore)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..dependencies.len() {
        if state[root] != Visit::Unvisited {
            continue;
        }
        state[root] = Visit::InProgress;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let Some(&dep) = dependencies[node].get(next) else {
                state[node] = Visit::Done;
                stack.pop();
                continue;
            };
            frame.1 += 1;

            match state[dep] {
                Visit::Unvisited => {
                    state[dep] = Visit::InProgress;
                    stack.push((dep, 0));
                }
                Visit::InProgress => {
                    let start = stack.iter().position(|&(n, _)| n == dep)?;
                    return Some(stack[start..].iter().map(|&(n, _)| n).collect());
                }
                Visit::Done => {}
            }
        }
    }
    None
}
