//! Directed acyclic graph of table dependencies.
//!
//! Edges point from an upstream table to the table that reads it. The graph
//! is built once per registry load; a cycle is a configuration error and is
//! reported with the tables that form it.
//!
//! **Note:** This module is internal to `tidemark-flow`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph with deterministic traversal order.
///
/// Ties are broken by insertion order so that the same configuration always
/// yields the same refresh order.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    /// Position of each node in insertion order.
    rank: HashMap<NodeIndex, usize>,
    insertion_order: Vec<NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            rank: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Adds a node, returning the existing index if already present.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.rank.insert(idx, self.insertion_order.len());
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a directed edge from `from` (upstream) to `to` (dependent).
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        self.weight(from)?;
        self.weight(to)?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    fn weight(&self, idx: NodeIndex) -> Result<&T> {
        self.graph
            .node_weight(idx)
            .ok_or_else(|| Error::DagNodeNotFound {
                node: format!("index {}", idx.index()),
            })
    }

    fn by_rank(&self, mut nodes: Vec<NodeIndex>) -> Vec<T> {
        nodes.sort_by_key(|n| self.rank.get(n).copied().unwrap_or(usize::MAX));
        nodes
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    /// Returns all nodes in topological order (upstreams first).
    ///
    /// Kahn's algorithm; ready nodes are released in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] naming every table on a cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, 0))
            .collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied() == Some(0))
            .copied()
            .collect();
        let mut ordered = Vec::with_capacity(self.graph.node_count());

        while let Some(idx) = queue.pop_front() {
            ordered.push(self.weight(idx)?.clone());

            let mut released: Vec<NodeIndex> = Vec::new();
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        released.push(next);
                    }
                }
            }
            released.sort_by_key(|n| self.rank.get(n).copied().unwrap_or(usize::MAX));
            queue.extend(released);
        }

        if ordered.len() != self.graph.node_count() {
            return Err(Error::CycleDetected {
                cycle: self.cycle_members(),
            });
        }
        Ok(ordered)
    }

    fn cycle_members(&self) -> Vec<String> {
        let mut members: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .flatten()
            .collect();
        members.sort_by_key(|n| self.rank.get(n).copied().unwrap_or(usize::MAX));
        members
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).map(ToString::to_string))
            .collect()
    }

    /// Returns every node reachable downstream of `value`, excluding itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown.
    pub fn transitive_downstream(&self, value: &T) -> Result<Vec<T>> {
        let start = self.index_of(value)?;
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut pending = vec![start];
        while let Some(idx) = pending.pop() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    pending.push(next);
                }
            }
        }
        seen.remove(&start);
        Ok(self.by_rank(seen.into_iter().collect()))
    }

    fn index_of(&self, value: &T) -> Result<NodeIndex> {
        self.index_map
            .get(value)
            .copied()
            .ok_or_else(|| Error::DagNodeNotFound {
                node: value.to_string(),
            })
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}
