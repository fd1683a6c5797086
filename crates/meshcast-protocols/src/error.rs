//! Error types for meshcast-protocols.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::channel::ConnectionId;

/// Result type for meshcast-protocols operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An identity is already bound to this address.
    #[error("address {0} is already registered")]
    DuplicateAddress(SocketAddr),

    /// A listener already exists on this address.
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    /// The remote broke the message ordering rules. Fatal to the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An outbound connection attempt failed.
    #[error("connection to {address} refused: {reason}")]
    ConnectionRefused { address: SocketAddr, reason: String },

    /// The remote did not open with its handshake message in time.
    #[error("connection {connection} sent no handshake within {after:?}")]
    HandshakeTimeout { connection: ConnectionId, after: Duration },

    /// The channel was closed before the message could be sent.
    #[error("channel {0} is closed")]
    ChannelClosed(ConnectionId),

    /// An acknowledgement diff named a peer as both added and removed.
    #[error("invalid acknowledgement diff: {0}")]
    ConflictingDiff(#[from] meshcast_topology::TopologyError),
}
