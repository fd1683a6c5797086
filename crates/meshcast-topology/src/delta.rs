//! Neighbour deltas: accumulated add/remove changes in one direction.
//!
//! A delta describes how a neighbour set changed since it was last
//! reported. It never names the same node as both added and removed; the
//! recording operations cancel opposite changes instead, so a disconnect
//! followed by a reconnect within one window leaves no trace.

use std::collections::BTreeSet;

use crate::error::{Result, TopologyError};

/// Net changes to one neighbour set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(
        try_from = "DeltaParts<K>",
        bound(
            serialize = "K: serde::Serialize",
            deserialize = "K: serde::Deserialize<'de> + Ord"
        )
    )
)]
pub struct NeighbourDelta<K> {
    added: BTreeSet<K>,
    removed: BTreeSet<K>,
}

impl<K: Ord> Default for NeighbourDelta<K> {
    fn default() -> Self {
        Self {
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<K: Ord> NeighbourDelta<K> {
    /// Create an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a delta from explicit sets, rejecting overlap.
    pub fn from_sets(added: BTreeSet<K>, removed: BTreeSet<K>) -> Result<Self> {
        let conflicts = added.intersection(&removed).count();
        if conflicts > 0 {
            return Err(TopologyError::ConflictingDelta { conflicts });
        }
        Ok(Self { added, removed })
    }

    /// Record that `node` became a neighbour.
    pub fn record_added(&mut self, node: K) {
        if !self.removed.remove(&node) {
            self.added.insert(node);
        }
    }

    /// Record that `node` stopped being a neighbour.
    pub fn record_removed(&mut self, node: K) {
        if !self.added.remove(&node) {
            self.removed.insert(node);
        }
    }

    /// Fold a later delta into this one.
    pub fn merge(&mut self, later: NeighbourDelta<K>) {
        for node in later.removed {
            self.record_removed(node);
        }
        for node in later.added {
            self.record_added(node);
        }
    }

    /// Fold an earlier delta underneath this one.
    pub fn prepend(&mut self, earlier: NeighbourDelta<K>) {
        let later = std::mem::replace(self, earlier);
        self.merge(later);
    }

    pub fn added(&self) -> &BTreeSet<K> {
        &self.added
    }

    pub fn removed(&self) -> &BTreeSet<K> {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn into_parts(self) -> (BTreeSet<K>, BTreeSet<K>) {
        (self.added, self.removed)
    }
}

impl<K: Ord + Clone> NeighbourDelta<K> {
    /// Apply this delta to a neighbour set.
    pub fn apply_to(&self, view: &mut BTreeSet<K>) {
        for node in &self.removed {
            view.remove(node);
        }
        view.extend(self.added.iter().cloned());
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
#[serde(bound(deserialize = "K: serde::Deserialize<'de> + Ord"))]
struct DeltaParts<K> {
    #[serde(default)]
    added: BTreeSet<K>,
    #[serde(default)]
    removed: BTreeSet<K>,
}

#[cfg(feature = "serde")]
impl<K: Ord> TryFrom<DeltaParts<K>> for NeighbourDelta<K> {
    type Error = TopologyError;

    fn try_from(parts: DeltaParts<K>) -> Result<Self> {
        Self::from_sets(parts.added, parts.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(nodes: &[u32]) -> BTreeSet<u32> {
        nodes.iter().copied().collect()
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let err = NeighbourDelta::from_sets(set(&[1, 2]), set(&[2, 3])).unwrap_err();
        assert_eq!(err, TopologyError::ConflictingDelta { conflicts: 1 });
    }

    #[test]
    fn remove_then_add_cancels() {
        let mut delta = NeighbourDelta::new();
        delta.record_removed(7u32);
        delta.record_added(7);
        assert!(delta.is_empty());
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut delta = NeighbourDelta::new();
        delta.record_added(7u32);
        delta.record_removed(7);
        assert!(delta.is_empty());
    }

    #[test]
    fn prepend_restores_unsent_changes() {
        let mut unsent = NeighbourDelta::new();
        unsent.record_added(1u32);
        unsent.record_added(2);

        let mut current = NeighbourDelta::new();
        current.record_removed(2);
        current.record_added(3);

        current.prepend(unsent);

        assert_eq!(current.added(), &set(&[1, 3]));
        assert!(current.removed().is_empty());
    }

    #[test]
    fn apply_to_view() {
        let mut view = set(&[1, 2, 3]);
        let delta = NeighbourDelta::from_sets(set(&[4]), set(&[1])).unwrap();
        delta.apply_to(&mut view);
        assert_eq!(view, set(&[2, 3, 4]));
    }

    #[derive(Debug, Clone)]
    enum Change {
        Add(u8),
        Remove(u8),
    }

    fn arb_changes() -> impl Strategy<Value = Vec<Change>> {
        prop::collection::vec(
            prop_oneof![(0u8..16).prop_map(Change::Add), (0u8..16).prop_map(Change::Remove)],
            0..64,
        )
    }

    /// Connect/disconnect toggles as a live link set produces them.
    fn arb_toggles() -> impl Strategy<Value = Vec<Change>> {
        prop::collection::vec(0u8..16, 0..64).prop_map(|nodes| {
            let mut connected = BTreeSet::new();
            nodes
                .into_iter()
                .map(|n| {
                    if connected.remove(&n) {
                        Change::Remove(n)
                    } else {
                        connected.insert(n);
                        Change::Add(n)
                    }
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn recorded_sets_stay_disjoint(changes in arb_changes()) {
            let mut delta = NeighbourDelta::new();
            for change in changes {
                match change {
                    Change::Add(n) => delta.record_added(n),
                    Change::Remove(n) => delta.record_removed(n),
                }
                prop_assert_eq!(delta.added().intersection(delta.removed()).count(), 0);
            }
        }

        #[test]
        fn split_accumulation_matches_single_accumulation(toggles in arb_toggles(), split in 0usize..64) {
            let split = split.min(toggles.len());
            let (first, second) = toggles.split_at(split);

            let record = |delta: &mut NeighbourDelta<u8>, changes: &[Change]| {
                for change in changes {
                    match change {
                        Change::Add(n) => delta.record_added(*n),
                        Change::Remove(n) => delta.record_removed(*n),
                    }
                }
            };

            let mut whole = NeighbourDelta::new();
            record(&mut whole, first);
            record(&mut whole, second);

            let mut earlier = NeighbourDelta::new();
            record(&mut earlier, first);
            let mut later = NeighbourDelta::new();
            record(&mut later, second);
            earlier.merge(later);

            prop_assert_eq!(earlier, whole);
        }
    }
}
