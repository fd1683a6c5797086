//! Error types for meshcast-topology.

use thiserror::Error;

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors that can occur while building or folding topology views.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// A delta names the same node as both added and removed.
    #[error("conflicting neighbour delta: {conflicts} node(s) both added and removed")]
    ConflictingDelta { conflicts: usize },
}
