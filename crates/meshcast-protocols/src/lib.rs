//! Meshcast Protocols - identities, connections and neighbour acknowledgement
//!
//! This crate provides the control plane of a Meshcast overlay:
//!
//! - [`IdentityRegistry`]: issues unique random identities to peers
//! - [`PeerConnectionManager`]: keeps a forwarder's outbound links in line
//!   with the neighbour set its distributor requests
//! - [`AcknowledgeAccumulator`] and [`AcknowledgeFlusher`]: report net
//!   neighbour changes upstream, one flush in flight at a time
//! - [`ConnectionGroup`]: close many connections at once, race-free
//! - [`Message`]: the wire vocabulary
//!
//! Transports plug in through the [`Channel`] and [`Connector`] traits.
//! [`MemoryNetwork`] is an in-process implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcast_protocols::{PeerConnectionManager, ReconnectPolicy};
//!
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let manager = PeerConnectionManager::new(me, connector, ReconnectPolicy::default(), events_tx);
//! manager.reconcile(&add, &remove);
//! while let Some(event) = events.recv().await {
//!     accumulator.lock().unwrap().record(&event);
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod acknowledge;
pub mod channel;
pub mod connection;
pub mod error;
pub mod group;
pub mod identity;
pub mod memory;
pub mod message;

pub use acknowledge::{
    AcknowledgeAccumulator, AcknowledgeDiff, AcknowledgeFlusher, ConnectionEvent, Direction, SharedAccumulator,
};
pub use channel::{Channel, ChannelRef, Connection, ConnectionId, Connector, Inbox};
pub use connection::{
    EventSender, InboundPeer, InboundPeers, PeerConnectionManager, PeerLink, PeerState, ReconnectPolicy,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use error::{Error, Result};
pub use group::ConnectionGroup;
pub use identity::{Identity, IdentityRegistry, IdentitySet, Token};
pub use memory::{connection_pair, MemoryChannel, MemoryListener, MemoryNetwork};
pub use message::Message;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
