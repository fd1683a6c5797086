//! Directed connectivity graphs.
//!
//! A [`Graph`] maps each node to the group of nodes it reports as neighbours.
//! An edge `u → v` means "u's latest report lists v". Nothing forces the
//! reverse edge to exist; reports are gossiped independently and may
//! disagree for a while.

use std::collections::BTreeMap;

use crate::NodeGroup;

/// Directed graph keyed by node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph<K> {
    adjacency: BTreeMap<K, NodeGroup<K>>,
}

impl<K: Ord> Default for Graph<K> {
    fn default() -> Self {
        Self {
            adjacency: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Graph<K> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a list of directed edges.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (K, K)>,
    {
        let mut graph = Self::new();
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        graph
    }

    /// Build a graph in which every node links to every other node.
    pub fn complete<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        let nodes: Vec<K> = nodes.into_iter().collect();
        let mut graph = Self::new();
        for from in &nodes {
            graph.add_node(from.clone());
            for to in &nodes {
                if from != to {
                    graph.add_edge(from.clone(), to.clone());
                }
            }
        }
        graph
    }

    /// Ensure a node exists, with no neighbours if it is new.
    pub fn add_node(&mut self, node: K) {
        self.adjacency.entry(node).or_default();
    }

    /// Add the directed edge `from → to`. Self-loops are ignored.
    pub fn add_edge(&mut self, from: K, to: K) {
        if from == to {
            return;
        }
        self.adjacency.entry(from).or_default().insert(to);
    }

    /// Remove the directed edge `from → to`. Returns true if it existed.
    pub fn remove_edge(&mut self, from: &K, to: &K) -> bool {
        self.adjacency
            .get_mut(from)
            .map(|neighbours| neighbours.remove(to))
            .unwrap_or(false)
    }

    /// Replace a node's neighbour group wholesale.
    pub fn set_neighbours(&mut self, node: K, mut neighbours: NodeGroup<K>) {
        neighbours.remove(&node);
        self.adjacency.insert(node, neighbours);
    }

    /// Remove a node together with every edge pointing at it.
    pub fn remove_node(&mut self, node: &K) {
        self.adjacency.remove(node);
        for neighbours in self.adjacency.values_mut() {
            neighbours.remove(node);
        }
    }

    /// The neighbours reported by `node`, if it is known.
    pub fn neighbours(&self, node: &K) -> Option<&NodeGroup<K>> {
        self.adjacency.get(node)
    }

    /// The neighbours reported by `node`, or an empty group.
    pub fn neighbours_or_empty(&self, node: &K) -> NodeGroup<K> {
        self.neighbours(node).cloned().unwrap_or_default()
    }

    pub fn contains_node(&self, node: &K) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn contains_edge(&self, from: &K, to: &K) -> bool {
        self.adjacency
            .get(from)
            .is_some_and(|neighbours| neighbours.contains(to))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &K> {
        self.adjacency.keys()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(NodeGroup::len).sum()
    }

    /// Drop every edge `u → v` for which `v → u` is absent.
    pub fn retain_bidirectional(&mut self) {
        let mut one_way = Vec::new();
        for (from, neighbours) in &self.adjacency {
            for to in neighbours {
                if !self.contains_edge(to, from) {
                    one_way.push((from.clone(), to.clone()));
                }
            }
        }

        for (from, to) in one_way {
            self.remove_edge(&from, &to);
        }
    }
}
