//! Meshcast Node - distributor and forwarder roles
//!
//! A Meshcast overlay has one distributor and many forwarders. The
//! distributor issues identities, introduces forwarders to each other, and
//! learns from their acknowledgements which of them are mutually connected.
//! It pushes each block to the largest such group, one chunk per member;
//! members relay chunks to each other until everyone holds the whole block.
//!
//! # Architecture
//!
//! - **Distributor**: identity registry, topology policy, mesh resolution, block push
//! - **Forwarder**: peer links, neighbour acknowledgement, chunk relay and reassembly
//! - **Config**: intervals, timeouts and retry policy, overridable from the environment
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use meshcast_node::{Advertise, Distributor, Forwarder, NodeConfig};
//! use meshcast_protocols::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = MemoryNetwork::new();
//!     let address: SocketAddr = "127.0.0.1:5000".parse()?;
//!     let distributor = Distributor::new(address, NodeConfig::default());
//!     distributor.serve(network.listen(address)?);
//!
//!     let listener = network.listen("127.0.0.1:6000".parse()?)?;
//!     let (forwarder, mut blocks) =
//!         Forwarder::join(Arc::new(network.clone()), address, Advertise::Port(6000), NodeConfig::default()).await?;
//!     forwarder.serve(listener);
//!
//!     distributor.push_block(bytes::Bytes::from_static(b"hello"), 0).await?;
//!     let block = blocks.recv().await;
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod distributor;
pub mod error;
pub mod forwarder;
pub mod logging;


pub use config::NodeConfig;
pub use distributor::Distributor;
pub use error::{NodeError, Result};
pub use forwarder::{Advertise, CompletedBlock, CompletedBlocks, Forwarder};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
