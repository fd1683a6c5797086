//! Mesh candidate resolution.
//!
//! Given the outbound and inbound connectivity graphs as gossiped to a root
//! node, find the groups of peers that are mutually and bidirectionally
//! connected from the root's point of view in both graphs.
//!
//! # Algorithm
//!
//! ```text
//! R := out(root) ∩ in(root)
//! drop every one-way edge in each graph
//! for r in R:
//!     candidate := (out(r) ∩ R) ∩ (in(r) ∩ R) ∪ {root, r}
//!     candidate ⊇ existing      → discard candidate
//!     candidate ⊂ existing(s)   → replace them with candidate
//!     otherwise                 → append candidate
//! strip root, rank by size (largest first)
//! ```
//!
//! This is a greedy walk over the root's neighbourhood, not a maximum clique
//! search. The retained groups always form an antichain: no group is a strict
//! subset of another.

use crate::{Graph, NodeGroup};

/// Compute the ranked mesh candidates around `root`.
///
/// Inputs are not mutated. The first group, if any, is the one to fan out to.
/// `root` never appears in the output.
pub fn find_meshes<K>(root: &K, outbound: &Graph<K>, inbound: &Graph<K>) -> Vec<NodeGroup<K>>
where
    K: Ord + Clone,
{
    let mut outbound = outbound.clone();
    let mut inbound = inbound.clone();

    let reachable = outbound
        .neighbours_or_empty(root)
        .intersection(&inbound.neighbours_or_empty(root));

    outbound.retain_bidirectional();
    inbound.retain_bidirectional();

    let mut meshes: Vec<NodeGroup<K>> = Vec::new();
    for peer in &reachable {
        let mut candidate = outbound
            .neighbours_or_empty(peer)
            .intersection(&reachable)
            .intersection(&inbound.neighbours_or_empty(peer).intersection(&reachable));
        candidate.insert(root.clone());
        candidate.insert(peer.clone());

        insert_candidate(&mut meshes, candidate);
    }

    for mesh in &mut meshes {
        mesh.remove(root);
    }
    meshes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    meshes
}

/// Fold a candidate into the running antichain, preferring specific groups.
fn insert_candidate<K: Ord + Clone>(meshes: &mut Vec<NodeGroup<K>>, candidate: NodeGroup<K>) {
    if meshes.iter().any(|existing| candidate.is_superset(existing)) {
        return;
    }

    // Any existing group the candidate narrows is replaced by it.
    meshes.retain(|existing| !candidate.is_subset(existing));
    meshes.push(candidate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn group(nodes: &[u32]) -> NodeGroup<u32> {
        nodes.iter().copied().collect()
    }

    fn evens_clique() -> Graph<u32> {
        Graph::complete((0..100).filter(|n| n % 2 == 0))
    }

    #[test]
    fn complete_graph_intersected_with_even_clique() {
        let outbound = Graph::complete(0u32..100);
        let inbound = evens_clique();

        let meshes = find_meshes(&0, &outbound, &inbound);

        let expected: NodeGroup<u32> = (2..100).filter(|n| n % 2 == 0).collect();
        assert_eq!(meshes, vec![expected]);
    }

    #[test]
    fn inputs_are_not_mutated() {
        let outbound = Graph::from_edges([(0u32, 1), (1, 0), (1, 2)]);
        let inbound = outbound.clone();
        let before = (outbound.clone(), inbound.clone());

        let _ = find_meshes(&0, &outbound, &inbound);

        assert_eq!((outbound, inbound), before);
    }

    #[test]
    fn unknown_root_yields_nothing() {
        let graph = Graph::complete(1u32..5);
        assert!(find_meshes(&0, &graph, &graph).is_empty());
    }

    #[test]
    fn one_way_peer_is_excluded() {
        // Root sees 1 and 2 in both directions, but 2 only hears from 1.
        let mut outbound = Graph::complete([0u32, 1, 2]);
        outbound.remove_edge(&2, &1);
        let inbound = Graph::complete([0u32, 1, 2]);

        let meshes = find_meshes(&0, &outbound, &inbound);

        assert_eq!(meshes, vec![group(&[1]), group(&[2])]);
    }

    #[test]
    fn two_disjoint_triangles_rank_by_size() {
        // Root links to everyone; {1,2,3} and {4,5} are separate cliques.
        let mut edges = Vec::new();
        for peer in 1u32..=5 {
            edges.push((0, peer));
            edges.push((peer, 0));
        }
        for (a, b) in [(1, 2), (2, 3), (1, 3), (4, 5)] {
            edges.push((a, b));
            edges.push((b, a));
        }
        let graph = Graph::from_edges(edges);

        let meshes = find_meshes(&0, &graph, &graph);

        assert_eq!(meshes, vec![group(&[1, 2, 3]), group(&[4, 5])]);
    }

    #[test]
    fn subset_candidate_replaces_broader_group() {
        let mut meshes = vec![group(&[0, 1, 2, 3]), group(&[0, 1, 2, 4])];
        insert_candidate(&mut meshes, group(&[0, 1, 2]));
        assert_eq!(meshes, vec![group(&[0, 1, 2])]);
    }

    #[test]
    fn superset_candidate_is_discarded() {
        let mut meshes = vec![group(&[0, 1])];
        insert_candidate(&mut meshes, group(&[0, 1, 2]));
        insert_candidate(&mut meshes, group(&[0, 1]));
        assert_eq!(meshes, vec![group(&[0, 1])]);
    }

    fn arb_graph() -> impl Strategy<Value = Graph<u8>> {
        prop::collection::vec((0u8..12, 0u8..12), 0..120).prop_map(Graph::from_edges)
    }

    proptest! {
        #[test]
        fn groups_form_an_antichain_without_root(
            outbound in arb_graph(),
            inbound in arb_graph(),
        ) {
            let meshes = find_meshes(&0, &outbound, &inbound);

            for (i, a) in meshes.iter().enumerate() {
                prop_assert!(!a.contains(&0));
                for (j, b) in meshes.iter().enumerate() {
                    if i != j {
                        prop_assert!(!(a.is_subset(b) && a.len() < b.len()));
                    }
                }
            }
            for pair in meshes.windows(2) {
                prop_assert!(pair[0].len() >= pair[1].len());
            }
        }

        #[test]
        fn every_member_is_mutually_linked_with_root(
            outbound in arb_graph(),
            inbound in arb_graph(),
        ) {
            for mesh in find_meshes(&0, &outbound, &inbound) {
                for peer in &mesh {
                    prop_assert!(outbound.contains_edge(&0, peer));
                    prop_assert!(inbound.contains_edge(&0, peer));
                }
            }
        }
    }
}
