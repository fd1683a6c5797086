//! Core types for Meshcast block transfer

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Block sequence number, assigned by the originating distributor
pub type Sequence = u64;

/// BLAKE3 digest
pub type Hash = [u8; 32];

/// Describes a block and its deterministic split into chunks.
///
/// Every chunk except the last carries `size / N` bytes; the last absorbs
/// the remainder `size % N`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the whole payload
    pub content_hash: Hash,
    /// Hash of each chunk, in order (length is the chunk count)
    pub chunk_hashes: Vec<Hash>,
    /// Block sequence number
    pub sequence: Sequence,
    /// Scheduling priority (informational)
    pub priority: u8,
    /// Total payload size in bytes
    pub size: u64,
    /// Remaining relay hops
    pub time_to_live: u8,
}

impl BlockHeader {
    /// Describe `payload` split into `chunk_count` chunks.
    pub fn new(
        sequence: Sequence,
        priority: u8,
        time_to_live: u8,
        payload: &[u8],
        chunk_count: u32,
    ) -> Result<Self> {
        let size = payload.len() as u64;
        let chunks = partition(sequence, size, chunk_count)?;
        let mut chunk_hashes = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let range = chunk.byte_range(size, chunk_count)?;
            chunk_hashes.push(*blake3::hash(&payload[range]).as_bytes());
        }

        Ok(Self {
            content_hash: *blake3::hash(payload).as_bytes(),
            chunk_hashes,
            sequence,
            priority,
            size,
            time_to_live,
        })
    }

    /// Describe `payload` as a single chunk.
    pub fn single(sequence: Sequence, priority: u8, time_to_live: u8, payload: &[u8]) -> Self {
        let hash = *blake3::hash(payload).as_bytes();
        Self {
            content_hash: hash,
            chunk_hashes: vec![hash],
            sequence,
            priority,
            size: payload.len() as u64,
            time_to_live,
        }
    }

    /// Number of chunks in this block
    pub fn chunk_count(&self) -> u32 {
        self.chunk_hashes.len() as u32
    }

    /// Header for chunk `index`
    pub fn chunk(&self, index: u32) -> Result<ChunkHeader> {
        chunk_header(self.sequence, self.size, self.chunk_count(), index)
    }

    /// Headers for every chunk, in order
    pub fn chunks(&self) -> Result<Vec<ChunkHeader>> {
        partition(self.sequence, self.size, self.chunk_count())
    }

    /// Slice chunk `index` out of the full payload
    pub fn chunk_payload(&self, payload: &Bytes, index: u32) -> Result<Bytes> {
        if payload.len() as u64 != self.size {
            return Err(TransferError::SizeMismatch {
                expected: self.size,
                actual: payload.len() as u64,
            });
        }
        let chunk = self.chunk(index)?;
        Ok(payload.slice(chunk.byte_range(self.size, self.chunk_count())?))
    }

    /// Copy of this header with one fewer relay hop remaining
    pub fn relayed(&self) -> Self {
        Self {
            time_to_live: self.time_to_live.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Short hex form of the content hash, for logs
    pub fn short_hash(&self) -> String {
        hex::encode(&self.content_hash[..4])
    }
}

/// Describes one chunk of a block. Always derived from a [`BlockHeader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkHeader {
    /// Sequence of the owning block
    pub sequence: Sequence,
    /// Position within the block
    pub chunk_index: u32,
    /// Chunk size in bytes
    pub size: u64,
}

impl ChunkHeader {
    /// Byte range of this chunk inside a block of `block_size` bytes split
    /// `chunk_count` ways.
    pub fn byte_range(&self, block_size: u64, chunk_count: u32) -> Result<std::ops::Range<usize>> {
        if chunk_count == 0 {
            return Err(TransferError::ZeroChunks);
        }
        if self.chunk_index >= chunk_count {
            return Err(TransferError::ChunkIndexOutOfRange {
                index: self.chunk_index,
                count: chunk_count,
            });
        }
        let start = self.chunk_index as u64 * (block_size / chunk_count as u64);
        Ok(start as usize..(start + self.size) as usize)
    }
}

/// Whether a chunk comes straight from the distributor or from a peer relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Distributor to forwarder
    Push,
    /// Forwarder to forwarder
    Forward,
}

/// A chunk together with the headers needed to verify and place it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub block: BlockHeader,
    pub chunk: ChunkHeader,
    pub payload: Bytes,
}

/// Split `size` bytes into `chunk_count` chunk headers.
///
/// Each chunk but the last has `size / chunk_count` bytes; the last also
/// takes `size % chunk_count`.
pub fn partition(sequence: Sequence, size: u64, chunk_count: u32) -> Result<Vec<ChunkHeader>> {
    if chunk_count == 0 {
        return Err(TransferError::ZeroChunks);
    }
    (0..chunk_count)
        .map(|index| chunk_header(sequence, size, chunk_count, index))
        .collect()
}

/// Header for chunk `index` of a `size`-byte block split `chunk_count` ways.
pub fn chunk_header(sequence: Sequence, size: u64, chunk_count: u32, index: u32) -> Result<ChunkHeader> {
    if chunk_count == 0 {
        return Err(TransferError::ZeroChunks);
    }
    if index >= chunk_count {
        return Err(TransferError::ChunkIndexOutOfRange {
            index,
            count: chunk_count,
        });
    }

    let default_size = size / chunk_count as u64;
    let size = if index == chunk_count - 1 {
        default_size + size % chunk_count as u64
    } else {
        default_size
    };

    Ok(ChunkHeader {
        sequence,
        chunk_index: index,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remainder_goes_to_last_chunk() {
        let sizes: Vec<u64> = partition(0, 1_000_003, 4)
            .unwrap()
            .iter()
            .map(|c| c.size)
            .collect();
        assert_eq!(sizes, vec![250_000, 250_000, 250_000, 250_003]);
    }

    #[test]
    fn zero_chunks_rejected() {
        assert_eq!(partition(0, 10, 0), Err(TransferError::ZeroChunks));
    }

    #[test]
    fn index_out_of_range_rejected() {
        assert_eq!(
            chunk_header(0, 10, 3, 3),
            Err(TransferError::ChunkIndexOutOfRange { index: 3, count: 3 })
        );
    }

    #[test]
    fn byte_range_rejects_bad_split() {
        let chunk = chunk_header(0, 10, 2, 1).unwrap();
        assert_eq!(chunk.byte_range(10, 0), Err(TransferError::ZeroChunks));
        assert_eq!(
            chunk.byte_range(10, 1),
            Err(TransferError::ChunkIndexOutOfRange { index: 1, count: 1 })
        );
        assert_eq!(chunk.byte_range(10, 2), Ok(5..10));
    }

    #[test]
    fn more_chunks_than_bytes() {
        let sizes: Vec<u64> = partition(0, 3, 5).unwrap().iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![0, 0, 0, 0, 3]);
    }

    #[test]
    fn header_hashes_each_chunk() {
        let payload = Bytes::from_static(b"abcdefghij");
        let header = BlockHeader::new(7, 0, 1, &payload, 3).unwrap();

        assert_eq!(header.chunk_count(), 3);
        let last = header.chunk_payload(&payload, 2).unwrap();
        assert_eq!(&last[..], b"ghij");
        assert_eq!(header.chunk_hashes[2], *blake3::hash(b"ghij").as_bytes());
    }

    #[test]
    fn single_chunk_block() {
        let header = BlockHeader::single(1, 0, 0, b"payload");
        assert_eq!(header.chunk_count(), 1);
        assert_eq!(header.content_hash, header.chunk_hashes[0]);
        assert_eq!(header.chunk(0).unwrap().size, 7);
    }

    #[test]
    fn relayed_decrements_ttl_without_underflow() {
        let header = BlockHeader::single(1, 0, 1, b"x");
        assert_eq!(header.relayed().time_to_live, 0);
        assert_eq!(header.relayed().relayed().time_to_live, 0);
    }

    proptest! {
        #[test]
        fn partition_covers_size_exactly(size in 0u64..10_000_000, count in 1u32..512) {
            let chunks = partition(0, size, count).unwrap();
            prop_assert_eq!(chunks.len(), count as usize);
            prop_assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), size);

            let (last, rest) = chunks.split_last().unwrap();
            for chunk in rest {
                prop_assert_eq!(chunk.size, size / count as u64);
            }
            prop_assert_eq!(last.size, size / count as u64 + size % count as u64);
        }

        #[test]
        fn chunk_ranges_tile_the_block(size in 0u64..100_000, count in 1u32..64) {
            let mut next = 0usize;
            for chunk in partition(0, size, count).unwrap() {
                let range = chunk.byte_range(size, count).unwrap();
                prop_assert_eq!(range.start, next);
                next = range.end;
            }
            prop_assert_eq!(next as u64, size);
        }
    }
}
