//! Error types for Meshcast nodes.

use meshcast_transfer::Sequence;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] meshcast_protocols::Error),

    /// Transfer error
    #[error("Transfer error: {0}")]
    Transfer(#[from] meshcast_transfer::TransferError),

    /// Invalid configuration value
    #[error("Invalid configuration: {var}={value:?}: {reason}")]
    Config {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// No forwarder group is available to push to
    #[error("No mesh available")]
    NoMesh,

    /// The delivery tracker was dropped before reporting
    #[error("Delivery of block {0} abandoned")]
    DeliveryAbandoned(Sequence),
}
