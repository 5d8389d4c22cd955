//! Free block pools
//!
//! A [`BlockPool`] holds the free blocks of one size class. Lookups are
//! best-fit within a single stream: the pool is ordered by
//! `(stream, size, address)`, so the first key at or after
//! `(stream, size)` is the smallest fitting block.

use std::collections::BTreeSet;

use super::block::{Block, BlockId, PoolKey, PoolKind};
use crate::backend::StreamId;

/// Size-ordered set of free blocks
#[derive(Debug)]
pub struct BlockPool {
    kind: PoolKind,
    blocks: BTreeSet<PoolKey>,
}

impl BlockPool {
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            blocks: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Insert a free block; returns false if it was already present
    pub fn insert(&mut self, block: &Block) -> bool {
        debug_assert!(block.is_reusable(), "only free blocks belong in a pool");
        debug_assert_eq!(block.pool, self.kind);
        self.blocks.insert(block.pool_key())
    }

    /// Remove a block; its size and address must not have changed since insertion
    pub fn remove(&mut self, block: &Block) -> bool {
        self.blocks.remove(&block.pool_key())
    }

    pub fn contains(&self, block: &Block) -> bool {
        self.blocks.contains(&block.pool_key())
    }

    /// Free blocks on `stream` of at least `size` bytes, smallest first
    pub fn candidates(&self, stream: StreamId, size: usize) -> impl Iterator<Item = &PoolKey> {
        self.blocks
            .range(PoolKey::lower_bound(stream, size)..)
            .take_while(move |key| key.stream == stream)
    }

    /// Smallest free block on `stream` of at least `size` bytes
    pub fn best_fit(&self, stream: StreamId, size: usize) -> Option<BlockId> {
        self.candidates(stream, size).next().map(|key| key.id)
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|key| key.id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes held by the pool
    pub fn cached_bytes(&self) -> usize {
        self.blocks.iter().map(|key| key.size).sum()
    }
}
