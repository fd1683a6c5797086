//! Node groups: sets of node keys compared by inclusion.

use std::collections::btree_set;
use std::collections::BTreeSet;

/// A set of nodes treated as one unit.
///
/// Groups are ordered sets so that resolver output is deterministic for a
/// given input, regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeGroup<K> {
    members: BTreeSet<K>,
}

impl<K: Ord> Default for NodeGroup<K> {
    fn default() -> Self {
        Self {
            members: BTreeSet::new(),
        }
    }
}

impl<K: Ord> NodeGroup<K> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns true if it was not already present.
    pub fn insert(&mut self, node: K) -> bool {
        self.members.insert(node)
    }

    /// Remove a node. Returns true if it was present.
    pub fn remove(&mut self, node: &K) -> bool {
        self.members.remove(node)
    }

    pub fn contains(&self, node: &K) -> bool {
        self.members.contains(node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, K> {
        self.members.iter()
    }

    /// True if every member of `self` is in `other` (equal groups included).
    pub fn is_subset(&self, other: &NodeGroup<K>) -> bool {
        self.members.is_subset(&other.members)
    }

    /// True if every member of `other` is in `self` (equal groups included).
    pub fn is_superset(&self, other: &NodeGroup<K>) -> bool {
        self.members.is_superset(&other.members)
    }

    /// Keep only the members for which `keep` returns true.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.members.retain(keep);
    }

    /// Borrow the underlying ordered set.
    pub fn as_set(&self) -> &BTreeSet<K> {
        &self.members
    }

    pub fn into_set(self) -> BTreeSet<K> {
        self.members
    }
}

impl<K: Ord + Clone> NodeGroup<K> {
    /// Members present in both groups.
    pub fn intersection(&self, other: &NodeGroup<K>) -> NodeGroup<K> {
        self.members.intersection(&other.members).cloned().collect()
    }
}

impl<K: Ord> FromIterator<K> for NodeGroup<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

impl<K: Ord> From<BTreeSet<K>> for NodeGroup<K> {
    fn from(members: BTreeSet<K>) -> Self {
        Self { members }
    }
}

impl<K> IntoIterator for NodeGroup<K> {
    type Item = K;
    type IntoIter = btree_set::IntoIter<K>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}

impl<'a, K> IntoIterator for &'a NodeGroup<K> {
    type Item = &'a K;
    type IntoIter = btree_set::Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}
