//! Error types for meshcast-transfer.

use thiserror::Error;

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors raised while partitioning, dispatching or reassembling blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// A block must be split into at least one chunk.
    #[error("chunk count must be at least 1")]
    ZeroChunks,

    /// A chunk index outside `[0, chunk_count)`.
    #[error("chunk index {index} out of range for {count} chunk(s)")]
    ChunkIndexOutOfRange { index: u32, count: u32 },

    /// The same target appears twice in one dispatch.
    #[error("target {0} listed more than once")]
    DuplicateTarget(String),

    /// Payload length does not match the header.
    #[error("payload is {actual} bytes, header says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A chunk's bytes do not hash to the value in the block header.
    #[error("chunk {index} of block {sequence} failed hash verification")]
    ChunkHashMismatch { sequence: u64, index: u32 },

    /// The reassembled block does not hash to the content hash.
    #[error("block {0} failed content hash verification")]
    ContentHashMismatch(u64),

    /// Two chunks of the same sequence disagree on the block header.
    #[error("conflicting headers for block {0}")]
    HeaderMismatch(u64),
}
