//! Block reassembly on the receiving side.
//!
//! Chunks arrive in any order, possibly more than once (direct push plus
//! peer relays). Each chunk is checked against the block header before it is
//! kept; the block is released once every chunk is present and the whole
//! payload matches the content hash.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Result, TransferError};
use crate::types::{BlockHeader, ChunkMessage, Sequence};

/// How many completed sequences are remembered for duplicate suppression
pub const DEFAULT_COMPLETED_HISTORY: usize = 1024;

/// How many incomplete blocks are held before the oldest is dropped
pub const DEFAULT_MAX_PARTIAL: usize = 64;

/// Outcome of offering a chunk to the assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Chunk was already held, or its block already completed
    Duplicate,
    /// Chunk stored; block still incomplete
    Pending { received: u32, total: u32 },
    /// Final chunk stored; the verified block payload
    Complete { block: BlockHeader, payload: Bytes },
}

impl Assembly {
    /// True if the chunk had not been seen before.
    pub fn is_new(&self) -> bool {
        !matches!(self, Assembly::Duplicate)
    }
}

#[derive(Debug)]
struct PartialBlock {
    header: BlockHeader,
    chunks: Vec<Option<Bytes>>,
    received: u32,
}

/// Collects chunks into verified blocks.
#[derive(Debug)]
pub struct BlockAssembler {
    partial: HashMap<Sequence, PartialBlock>,
    partial_order: VecDeque<Sequence>,
    max_partial: usize,
    completed: HashSet<Sequence>,
    completed_order: VecDeque<Sequence>,
    history: usize,
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self::with_history(DEFAULT_COMPLETED_HISTORY)
    }
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember up to `history` completed sequences.
    pub fn with_history(history: usize) -> Self {
        Self::with_limits(history, DEFAULT_MAX_PARTIAL)
    }

    /// Remember up to `history` completed sequences and hold at most
    /// `max_partial` incomplete blocks. When a chunk opens one block too
    /// many, the block that was opened first is abandoned.
    pub fn with_limits(history: usize, max_partial: usize) -> Self {
        Self {
            partial: HashMap::new(),
            partial_order: VecDeque::new(),
            max_partial: max_partial.max(1),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
            history: history.max(1),
        }
    }

    /// Offer one chunk.
    pub fn insert(&mut self, message: &ChunkMessage) -> Result<Assembly> {
        let block = &message.block;
        let sequence = block.sequence;
        if self.completed.contains(&sequence) {
            return Ok(Assembly::Duplicate);
        }

        let index = message.chunk.chunk_index;
        if block.chunk(index)? != message.chunk {
            return Err(TransferError::HeaderMismatch(sequence));
        }
        if message.payload.len() as u64 != message.chunk.size {
            return Err(TransferError::SizeMismatch {
                expected: message.chunk.size,
                actual: message.payload.len() as u64,
            });
        }
        if *blake3::hash(&message.payload).as_bytes() != block.chunk_hashes[index as usize] {
            return Err(TransferError::ChunkHashMismatch { sequence, index });
        }

        if !self.partial.contains_key(&sequence) {
            self.make_room();
            self.partial_order.push_back(sequence);
        }
        let partial = self.partial.entry(sequence).or_insert_with(|| PartialBlock {
            header: block.clone(),
            chunks: vec![None; block.chunk_count() as usize],
            received: 0,
        });
        if !same_block(&partial.header, block) {
            return Err(TransferError::HeaderMismatch(sequence));
        }

        let slot = &mut partial.chunks[index as usize];
        if slot.is_some() {
            return Ok(Assembly::Duplicate);
        }
        *slot = Some(message.payload.clone());
        partial.received += 1;

        let total = partial.chunks.len() as u32;
        if partial.received < total {
            trace!(sequence, received = partial.received, total, "Chunk stored");
            return Ok(Assembly::Pending {
                received: partial.received,
                total,
            });
        }

        let Some(partial) = self.take_partial(sequence) else {
            return Ok(Assembly::Duplicate);
        };
        let mut payload = BytesMut::with_capacity(partial.header.size as usize);
        for chunk in partial.chunks.into_iter().flatten() {
            payload.extend_from_slice(&chunk);
        }
        if *blake3::hash(&payload).as_bytes() != partial.header.content_hash {
            return Err(TransferError::ContentHashMismatch(sequence));
        }

        self.remember_completed(sequence);
        debug!(sequence, size = partial.header.size, hash = %partial.header.short_hash(), "Block reassembled");
        Ok(Assembly::Complete {
            block: partial.header,
            payload: payload.freeze(),
        })
    }

    /// Number of blocks with at least one chunk but not yet complete.
    pub fn pending_blocks(&self) -> usize {
        self.partial.len()
    }

    /// Discard a partially received block.
    pub fn abandon(&mut self, sequence: Sequence) -> bool {
        self.take_partial(sequence).is_some()
    }

    fn take_partial(&mut self, sequence: Sequence) -> Option<PartialBlock> {
        let partial = self.partial.remove(&sequence)?;
        self.partial_order.retain(|held| *held != sequence);
        Some(partial)
    }

    fn make_room(&mut self) {
        while self.partial.len() >= self.max_partial {
            let Some(oldest) = self.partial_order.front().copied() else {
                break;
            };
            if let Some(dropped) = self.take_partial(oldest) {
                debug!(
                    sequence = oldest,
                    received = dropped.received,
                    total = dropped.chunks.len(),
                    "Abandoned incomplete block"
                );
            }
        }
    }

    fn remember_completed(&mut self, sequence: Sequence) {
        self.completed.insert(sequence);
        self.completed_order.push_back(sequence);
        while self.completed_order.len() > self.history {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

/// Headers describe the same block regardless of remaining relay hops.
fn same_block(a: &BlockHeader, b: &BlockHeader) -> bool {
    a.content_hash == b.content_hash && a.chunk_hashes == b.chunk_hashes && a.size == b.size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks_of(payload: &'static [u8], count: u32) -> Vec<ChunkMessage> {
        chunks_for(1, payload, count)
    }

    fn chunks_for(sequence: Sequence, payload: &'static [u8], count: u32) -> Vec<ChunkMessage> {
        let payload = Bytes::from_static(payload);
        let block = BlockHeader::new(sequence, 0, 2, &payload, count).unwrap();
        (0..count)
            .map(|i| ChunkMessage {
                block: block.clone(),
                chunk: block.chunk(i).unwrap(),
                payload: block.chunk_payload(&payload, i).unwrap(),
            })
            .collect()
    }

    #[test]
    fn reassembles_out_of_order() {
        let mut chunks = chunks_of(b"the quick brown fox", 4);
        chunks.reverse();
        let mut assembler = BlockAssembler::new();

        let mut outcome = None;
        for chunk in &chunks {
            outcome = Some(assembler.insert(chunk).unwrap());
        }

        match outcome.unwrap() {
            Assembly::Complete { payload, .. } => assert_eq!(&payload[..], b"the quick brown fox"),
            other => panic!("expected complete block, got {:?}", other),
        }
        assert_eq!(assembler.pending_blocks(), 0);
    }

    #[test]
    fn duplicates_are_reported() {
        let chunks = chunks_of(b"abcdef", 2);
        let mut assembler = BlockAssembler::new();

        assert_eq!(
            assembler.insert(&chunks[0]).unwrap(),
            Assembly::Pending { received: 1, total: 2 }
        );
        assert_eq!(assembler.insert(&chunks[0]).unwrap(), Assembly::Duplicate);
        assert!(assembler.insert(&chunks[1]).unwrap().is_new());
        assert_eq!(assembler.insert(&chunks[1]).unwrap(), Assembly::Duplicate);
    }

    #[test]
    fn relayed_copy_with_lower_ttl_is_same_block() {
        let chunks = chunks_of(b"abcdef", 2);
        let mut relayed = chunks[1].clone();
        relayed.block = relayed.block.relayed();
        let mut assembler = BlockAssembler::new();

        assembler.insert(&chunks[0]).unwrap();
        assert!(matches!(assembler.insert(&relayed).unwrap(), Assembly::Complete { .. }));
    }

    #[test]
    fn corrupted_chunk_rejected() {
        let mut chunks = chunks_of(b"abcdef", 2);
        chunks[0].payload = Bytes::from_static(b"xyz");
        let mut assembler = BlockAssembler::new();

        assert_eq!(
            assembler.insert(&chunks[0]),
            Err(TransferError::ChunkHashMismatch { sequence: 1, index: 0 })
        );
    }

    #[test]
    fn wrong_size_rejected() {
        let mut chunks = chunks_of(b"abcdef", 2);
        chunks[0].payload = Bytes::from_static(b"ab");
        let mut assembler = BlockAssembler::new();

        assert!(matches!(
            assembler.insert(&chunks[0]),
            Err(TransferError::SizeMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn completed_history_is_bounded() {
        let mut assembler = BlockAssembler::with_history(2);
        for sequence in 0..3u64 {
            let block = BlockHeader::single(sequence, 0, 0, b"x");
            let message = ChunkMessage {
                chunk: block.chunk(0).unwrap(),
                block,
                payload: Bytes::from_static(b"x"),
            };
            assembler.insert(&message).unwrap();
        }
        assert_eq!(assembler.completed.len(), 2);
        assert!(!assembler.completed.contains(&0));
    }

    #[test]
    fn incomplete_blocks_are_bounded() {
        let mut assembler = BlockAssembler::with_limits(4, 3);
        let blocks: Vec<_> = (0..10u64).map(|sequence| chunks_for(sequence, b"abcdef", 2)).collect();

        for chunks in &blocks {
            assembler.insert(&chunks[0]).unwrap();
        }
        assert_eq!(assembler.pending_blocks(), 3);
        assert_eq!(assembler.partial_order.len(), 3);

        // The oldest blocks were dropped; their second halves start over.
        assert_eq!(
            assembler.insert(&blocks[0][1]).unwrap(),
            Assembly::Pending { received: 1, total: 2 }
        );
        assert!(matches!(
            assembler.insert(&blocks[9][1]).unwrap(),
            Assembly::Complete { .. }
        ));
        assert_eq!(assembler.pending_blocks(), 2);
        assert_eq!(assembler.partial_order.len(), 2);
    }
}
