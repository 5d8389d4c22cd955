//! Blocks and segments
//!
//! A [`Segment`] is one region reserved from the device allocator. It is
//! carved into [`Block`]s that form an address-ordered doubly linked list
//! through their `prev`/`next` ids. Adjacent free blocks are merged back
//! together when they are released.

use std::backtrace::Backtrace;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{DeviceIndex, DevicePtr, StreamId};

/// Stable handle of a block inside one device cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Size class of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Requests below the small size threshold
    Small,
    /// Everything else
    Large,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Small => "small",
            PoolKind::Large => "large",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-range of a segment, either handed out or cached
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub device: DeviceIndex,
    /// Stream the block was allocated on; it is only reused on this stream
    pub stream: StreamId,
    pub ptr: DevicePtr,
    /// Rounded size in bytes
    pub size: usize,
    /// Unrounded size of the request currently occupying the block
    pub requested_size: usize,
    pub pool: PoolKind,
    /// Belongs to a segment reserved for an oversize request
    pub oversize: bool,
    /// Base address of the owning segment
    pub segment: DevicePtr,
    pub allocated: bool,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    /// Foreign streams that used the block while it was allocated
    pub stream_uses: BTreeSet<StreamId>,
    /// Outstanding events that must complete before reuse
    pub event_count: usize,
    /// Garbage collection age, bumped on every lookup in its pool
    pub gc_count: usize,
    /// Call site of the allocation, when history context is enabled
    pub context: Option<Arc<Backtrace>>,
}

impl Block {
    /// A free block covering a whole new segment
    pub fn new_segment_head(
        id: BlockId,
        device: DeviceIndex,
        stream: StreamId,
        ptr: DevicePtr,
        size: usize,
        pool: PoolKind,
        oversize: bool,
    ) -> Self {
        Self {
            id,
            device,
            stream,
            ptr,
            size,
            requested_size: 0,
            pool,
            oversize,
            segment: ptr,
            allocated: false,
            prev: None,
            next: None,
            stream_uses: BTreeSet::new(),
            event_count: 0,
            gc_count: 0,
            context: None,
        }
    }

    /// A free block carved from the tail of `parent`
    pub fn split_from(parent: &Block, id: BlockId, offset: usize, size: usize) -> Self {
        Self {
            id,
            device: parent.device,
            stream: parent.stream,
            ptr: parent.ptr.offset(offset),
            size,
            requested_size: 0,
            pool: parent.pool,
            oversize: parent.oversize,
            segment: parent.segment,
            allocated: false,
            prev: Some(parent.id),
            next: parent.next,
            stream_uses: BTreeSet::new(),
            event_count: 0,
            gc_count: 0,
            context: None,
        }
    }

    /// Shares its segment with at least one other block
    pub fn is_split(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }

    /// Free, not waiting on any stream, and therefore eligible for a pool
    pub fn is_reusable(&self) -> bool {
        !self.allocated && self.event_count == 0
    }

    /// Key under which the block is stored in a free pool
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            stream: self.stream,
            size: self.size,
            ptr: self.ptr,
            id: self.id,
        }
    }
}

/// Ordering of free blocks: by stream, then size, then address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolKey {
    pub stream: StreamId,
    pub size: usize,
    pub ptr: DevicePtr,
    pub id: BlockId,
}

impl PoolKey {
    /// Smallest key on `stream` whose size is at least `size`
    pub fn lower_bound(stream: StreamId, size: usize) -> Self {
        Self {
            stream,
            size,
            ptr: DevicePtr::NULL,
            id: BlockId(0),
        }
    }
}

/// One reservation from the device allocator
#[derive(Debug)]
pub struct Segment {
    pub device: DeviceIndex,
    pub ptr: DevicePtr,
    pub size: usize,
    pub stream: StreamId,
    pub pool: PoolKind,
    pub oversize: bool,
    /// First block in address order
    pub head: BlockId,
    /// Reservation time, microseconds since the Unix epoch
    pub allocated_at_us: u64,
    pub context: Option<Arc<Backtrace>>,
}
