//! Meshcast Topology
//!
//! Directed connectivity graphs and mesh candidate resolution for an overlay
//! in which a coordinating node fans payloads out to groups of peers.
//!
//! # Two Graphs
//!
//! Every peer gossips two neighbour sets upstream, independently:
//! - **outbound**: peers it has dialled and engaged
//! - **inbound**: peers that dialled it and announced themselves
//!
//! The coordinator folds these into two directed graphs ([`NeighbourViews`]).
//! Because the reports travel separately, the graphs may transiently
//! disagree; the resolver only trusts edges present in both directions of
//! both graphs.
//!
//! # Mesh Candidates
//!
//! [`find_meshes`] walks the root's mutually connected neighbours and returns
//! an antichain of groups, largest first. The first group is the broadcast
//! target.

mod delta;
mod error;
mod graph;
mod group;
mod mesh;
mod views;

pub use delta::NeighbourDelta;
pub use error::{Result, TopologyError};
pub use graph::Graph;
pub use group::NodeGroup;
pub use mesh::find_meshes;
pub use views::{NeighbourView, NeighbourViews};
