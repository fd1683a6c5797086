//! Meshcast Transfer - block partitioning, fan-out and reassembly
//!
//! This crate provides:
//! - Deterministic partitioning of a block into chunks ([`partition`])
//! - Per-dispatch delivery tracking with at-least-once completion accounting
//!   ([`DeliveryTracker`])
//! - Verified reassembly of chunks back into blocks ([`BlockAssembler`])
//!
//! # Fan-out
//!
//! The distributor splits a block into as many chunks as the selected group
//! has members and pushes chunk `i` to member `i`. Members relay what they
//! receive to their peers, so every member ends up with every chunk while
//! the distributor uploads each byte once.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcast_transfer::{BlockHeader, DeliveryConfig, DeliveryTracker};
//!
//! let block = BlockHeader::new(sequence, 0, 1, &payload, members.len() as u32)?;
//! let assignments = members.into_iter().zip(0..).collect();
//! DeliveryTracker::push(&block, &payload, assignments, DeliveryConfig::default(), |report| {
//!     tracing::info!(failed = report.failed.len(), "push finished");
//! })?;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod assembly;
pub mod error;
pub mod tracker;
pub mod types;

// Re-export main types at crate root
pub use assembly::{Assembly, BlockAssembler, DEFAULT_MAX_PARTIAL};
pub use error::{Result, TransferError};
pub use tracker::{ChunkTarget, DeliveryConfig, DeliveryReport, DeliveryTracker, SendFuture, DEFAULT_SEND_TIMEOUT};
pub use types::{chunk_header, partition, BlockHeader, ChunkHeader, ChunkKind, ChunkMessage, Hash, Sequence};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
