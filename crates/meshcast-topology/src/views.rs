//! Latest neighbour views per reporting node, folded into graphs.

use std::collections::{BTreeMap, BTreeSet};

use crate::{Graph, NeighbourDelta};

/// One reporter's latest acknowledged neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighbourView<K> {
    /// Nodes the reporter holds an outbound connection to.
    pub outbound: BTreeSet<K>,
    /// Nodes the reporter holds an inbound connection from.
    pub inbound: BTreeSet<K>,
}

impl<K: Ord> Default for NeighbourView<K> {
    fn default() -> Self {
        Self {
            outbound: BTreeSet::new(),
            inbound: BTreeSet::new(),
        }
    }
}

/// Per-reporter neighbour views. Only the latest state is kept.
#[derive(Debug, Clone)]
pub struct NeighbourViews<K> {
    views: BTreeMap<K, NeighbourView<K>>,
}

impl<K: Ord> Default for NeighbourViews<K> {
    fn default() -> Self {
        Self {
            views: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> NeighbourViews<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a reporter's outbound and inbound deltas into its view.
    pub fn apply(&mut self, reporter: K, outbound: &NeighbourDelta<K>, inbound: &NeighbourDelta<K>) {
        let view = self.views.entry(reporter).or_default();
        outbound.apply_to(&mut view.outbound);
        inbound.apply_to(&mut view.inbound);
    }

    /// Drop everything known about a reporter.
    pub fn forget(&mut self, reporter: &K) -> Option<NeighbourView<K>> {
        self.views.remove(reporter)
    }

    pub fn view(&self, reporter: &K) -> Option<&NeighbourView<K>> {
        self.views.get(reporter)
    }

    pub fn reporters(&self) -> impl Iterator<Item = &K> {
        self.views.keys()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Build the outbound and inbound graphs seen from `root`.
    ///
    /// `root` is linked in both directions, in both graphs, to every peer in
    /// `engaged`; reporters contribute their own latest views.
    pub fn graphs<'a, I>(&self, root: &K, engaged: I) -> (Graph<K>, Graph<K>)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut outbound = Graph::new();
        let mut inbound = Graph::new();
        outbound.add_node(root.clone());
        inbound.add_node(root.clone());

        for peer in engaged {
            for graph in [&mut outbound, &mut inbound] {
                graph.add_edge(root.clone(), peer.clone());
                graph.add_edge(peer.clone(), root.clone());
            }
        }

        for (reporter, view) in &self.views {
            outbound.add_node(reporter.clone());
            inbound.add_node(reporter.clone());
            for to in &view.outbound {
                outbound.add_edge(reporter.clone(), to.clone());
            }
            for from in &view.inbound {
                inbound.add_edge(reporter.clone(), from.clone());
            }
        }

        (outbound, inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::find_meshes;

    fn added(nodes: &[u32]) -> NeighbourDelta<u32> {
        let mut delta = NeighbourDelta::new();
        for &n in nodes {
            delta.record_added(n);
        }
        delta
    }

    #[test]
    fn apply_accumulates_latest_view() {
        let mut views = NeighbourViews::new();
        views.apply(1u32, &added(&[2, 3]), &added(&[2]));

        let mut second = NeighbourDelta::new();
        second.record_removed(3);
        views.apply(1, &second, &NeighbourDelta::new());

        let view = views.view(&1).unwrap();
        assert_eq!(view.outbound, [2].into_iter().collect());
        assert_eq!(view.inbound, [2].into_iter().collect());
    }

    #[test]
    fn root_is_linked_to_engaged_peers() {
        let views: NeighbourViews<u32> = NeighbourViews::new();
        let (outbound, inbound) = views.graphs(&0, &[1, 2]);

        for graph in [&outbound, &inbound] {
            assert!(graph.contains_edge(&0, &1));
            assert!(graph.contains_edge(&2, &0));
        }
    }

    #[test]
    fn fully_acknowledged_pair_forms_one_mesh() {
        let mut views = NeighbourViews::new();
        views.apply(1u32, &added(&[2]), &added(&[2]));
        views.apply(2, &added(&[1]), &added(&[1]));

        let (outbound, inbound) = views.graphs(&0, &[1, 2]);
        let meshes = find_meshes(&0, &outbound, &inbound);

        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].len(), 2);
    }

    #[test]
    fn forget_removes_reporter_edges() {
        let mut views = NeighbourViews::new();
        views.apply(1u32, &added(&[2]), &added(&[2]));
        assert!(views.forget(&1).is_some());

        let (outbound, _) = views.graphs(&0, &[2]);
        assert!(!outbound.contains_edge(&1, &2));
    }
}
