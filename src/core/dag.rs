//! Step dependency graph.
//!
//! StepGraph mirrors a workflow's `depends_on` lists as a petgraph DiGraph so
//! that structural problems (unknown dependencies, cycles, missing roots) can
//! be rejected before a workflow ever runs.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::{Error, Result};

/// Dependency graph over step ids.
///
/// An edge `a -> b` means step `b` depends on step `a`.
#[derive(Debug, Default)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(step_id, depends_on)` pairs.
    ///
    /// # Errors
    /// Returns [`Error::Structural`] for duplicate step ids or a dependency
    /// naming a step that does not exist. Cycles are not rejected here; see
    /// [`StepGraph::validate`].
    pub fn build<'a, I, D>(steps: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut graph = Self::new();
        let mut edges = Vec::new();

        for (id, deps) in steps {
            if graph.index.contains_key(id) {
                return Err(Error::Structural(format!("duplicate step id: {}", id)));
            }
            let node = graph.graph.add_node(id.to_string());
            graph.index.insert(id.to_string(), node);
            edges.extend(deps.into_iter().map(|dep| (dep, id)));
        }

        for (dep, id) in edges {
            let from = graph.index.get(dep).copied().ok_or_else(|| {
                Error::Structural(format!("step {} depends on unknown step {}", id, dep))
            })?;
            let to = graph.index[id];
            graph.graph.update_edge(from, to, ());
        }

        Ok(graph)
    }

    /// Reject graphs that can never run to completion.
    ///
    /// A graph must be non-empty, acyclic, and have at least one step with
    /// no dependencies.
    pub fn validate(&self) -> Result<()> {
        if self.graph.node_count() == 0 {
            return Err(Error::Structural("workflow has no steps".to_string()));
        }
        if self.roots().is_empty() {
            return Err(Error::Structural(
                "workflow has no step without dependencies".to_string(),
            ));
        }
        if is_cyclic_directed(&self.graph) {
            return Err(Error::Structural(
                "workflow step dependencies contain a cycle".to_string(),
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Steps with no dependencies, sorted by id.
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .graph
            .externals(Direction::Incoming)
            .map(|node| self.graph[node].clone())
            .collect();
        roots.sort();
        roots
    }

    /// Step ids in an order where every dependency precedes its dependents.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n].clone()).collect())
            .map_err(|cycle| {
                Error::Structural(format!(
                    "cycle detected at step {}",
                    self.graph[cycle.node_id()]
                ))
            })
    }

    /// Direct dependents of a step.
    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        let Some(&node) = self.index.get(id) else {
            return BTreeSet::new();
        };
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Every step reachable from `id` through dependent edges, excluding `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let Some(&node) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut reached = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, node);
        while let Some(next) = dfs.next(&self.graph) {
            if next != node {
                reached.insert(self.graph[next].clone());
            }
        }
        reached
    }
}
