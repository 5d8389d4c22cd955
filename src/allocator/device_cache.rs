//! Per-device caching allocator
//!
//! [`DeviceCachingAllocator`] owns every segment, block, pool, statistic and
//! history entry of one device. It is not thread-safe by itself; the
//! multi-device allocator wraps each instance in its own mutex.
//!
//! # Allocation
//!
//! 1. Reclaim blocks whose stream events have completed
//! 2. Round the request and pick the small or large pool
//! 3. Best-fit lookup in that pool, same stream only
//! 4. On a miss, optionally garbage collect, then reserve a new segment
//! 5. If the device is out of memory (or the memory fraction is reached),
//!    release every cached segment and retry once
//! 6. Split the found block when the remainder is worth keeping

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::block::{Block, BlockId, PoolKind, Segment};
use super::config::{AllocatorConfig, LARGE_BUFFER, MIN_BLOCK_SIZE, SMALL_SIZE};
use super::history::{frames_of, now_us, HistoryOptions, HistoryRecorder, TraceAction};
use super::pool::BlockPool;
use super::snapshot::{BlockInfo, BlockState, SegmentInfo, TraceEntryInfo};
use super::stats::{format_size, DeviceStats, StatType, StatTypes};
use super::stream_tracker::StreamTracker;
use crate::backend::{DeviceAllocator, DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};

/// Caching allocator state of one device
#[derive(Debug)]
pub struct DeviceCachingAllocator {
    device: DeviceIndex,
    backend: Arc<dyn DeviceAllocator>,
    config: Arc<AllocatorConfig>,
    blocks: HashMap<BlockId, Block>,
    next_block_id: u64,
    /// Segments keyed by base address
    segments: BTreeMap<DevicePtr, Segment>,
    small_pool: BlockPool,
    large_pool: BlockPool,
    /// Blocks currently handed out, keyed by address
    active_blocks: HashMap<DevicePtr, BlockId>,
    tracker: StreamTracker,
    stats: DeviceStats,
    history: HistoryRecorder,
    /// Reservation cap from the memory fraction
    allowed_memory_maximum: Option<usize>,
    /// Cached device capacity
    device_total: Option<usize>,
    /// Bytes currently reserved from the device
    total_reserved: usize,
}

fn missing_block(id: BlockId) -> AllocatorError {
    AllocatorError::InvalidPointer(format!("block {} is not tracked", id))
}

impl DeviceCachingAllocator {
    pub fn new(
        device: DeviceIndex,
        backend: Arc<dyn DeviceAllocator>,
        config: Arc<AllocatorConfig>,
    ) -> Self {
        let stats = DeviceStats::new(config.max_split_size);
        Self {
            device,
            backend,
            config,
            blocks: HashMap::new(),
            next_block_id: 1,
            segments: BTreeMap::new(),
            small_pool: BlockPool::new(PoolKind::Small),
            large_pool: BlockPool::new(PoolKind::Large),
            active_blocks: HashMap::new(),
            tracker: StreamTracker::new(),
            stats,
            history: HistoryRecorder::new(),
            allowed_memory_maximum: None,
            device_total: None,
            total_reserved: 0,
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Allocate `requested` bytes usable on `stream`
    pub fn malloc(&mut self, requested: usize, stream: StreamId) -> AllocResult<DevicePtr> {
        self.process_events()?;

        let small = self.config.is_small(requested);
        let pool = if small { PoolKind::Small } else { PoolKind::Large };
        let rounded = self.config.round_size(requested).and_then(|size| {
            self.config
                .segment_size(size, small)
                .map(|segment_size| (size, segment_size))
        });
        let Some((size, segment_size)) = rounded else {
            return Err(self.out_of_memory(requested, stream));
        };
        let oversize = self.config.is_oversize(size);

        let id = match self.get_free_block(pool, stream, size, oversize) {
            Some(id) => id,
            None => {
                self.garbage_collect_cached_blocks()?;
                match self.alloc_segment(segment_size, pool, oversize, stream)? {
                    Some(id) => id,
                    None => self.retry_after_flush(requested, size, segment_size, pool, oversize, stream)?,
                }
            }
        };
        self.alloc_found_block(id, requested, size)
    }

    /// Return an allocation to the cache
    ///
    /// Blocks used by foreign streams are parked until those streams catch up.
    pub fn free(&mut self, ptr: DevicePtr) -> AllocResult<()> {
        let id = self.active_blocks.get(&ptr).copied().ok_or_else(|| {
            AllocatorError::InvalidPointer(format!(
                "{} is not an active allocation on device {}",
                ptr, self.device
            ))
        })?;

        // Events first: a failure here leaves the allocation live.
        let block = self.blocks.get_mut(&id).ok_or_else(|| missing_block(id))?;
        let deferred = self.tracker.defer(block, self.backend.as_ref(), self.device)?;
        block.allocated = false;
        let (size, pool, oversize, stream) = (block.size, block.pool, block.oversize, block.stream);
        let context = block.context.clone();
        self.active_blocks.remove(&ptr);

        self.stats
            .block_freed(StatTypes::for_block(pool, oversize), oversize, size);
        self.history.record(
            TraceAction::FreeRequested,
            self.device,
            ptr,
            size,
            stream,
            context.as_ref(),
        );

        if deferred == 0 {
            self.free_block(id)?;
        }
        Ok(())
    }

    /// Mark an active allocation as used by `stream`
    pub fn record_stream(&mut self, ptr: DevicePtr, stream: StreamId) -> AllocResult<()> {
        let id = self.active_blocks.get(&ptr).copied().ok_or_else(|| {
            AllocatorError::InvalidPointer(format!(
                "{} is not an active allocation on device {}",
                ptr, self.device
            ))
        })?;
        let block = self.blocks.get_mut(&id).ok_or_else(|| missing_block(id))?;
        StreamTracker::record_stream(block, stream);
        Ok(())
    }

    /// Cap reservations at `fraction` of the device capacity
    pub fn set_memory_fraction(&mut self, fraction: f64) -> AllocResult<()> {
        super::validate_fraction(fraction)?;
        let total = self.device_total()?;
        let allowed = (fraction * total as f64) as usize;
        self.allowed_memory_maximum = Some(allowed);
        tracing::info!(
            "DeviceCachingAllocator[{}]: memory fraction {} caps reservations at {}",
            self.device,
            fraction,
            format_size(allowed as i64)
        );
        Ok(())
    }

    /// Release every cached segment that holds no allocation
    pub fn empty_cache(&mut self) -> AllocResult<()> {
        self.release_cached_blocks()
    }

    /// Wait for all pending frees and return them to their pools
    pub fn synchronize(&mut self) -> AllocResult<()> {
        self.synchronize_and_free_events()
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn reset_peak_stats(&mut self) {
        self.stats.reset_peak();
    }

    pub fn reset_accumulated_stats(&mut self) {
        self.stats.reset_accumulated();
    }

    pub fn record_history(&mut self, options: HistoryOptions) {
        self.history.configure(options);
    }

    /// Bytes currently reserved from the device
    pub fn reserved_bytes(&self) -> usize {
        self.total_reserved
    }

    /// Number of free blocks held by both pools
    pub fn cached_blocks(&self) -> usize {
        self.small_pool.len() + self.large_pool.len()
    }

    /// Number of blocks waiting on stream events
    pub fn pending_frees(&self) -> usize {
        self.blocks
            .values()
            .filter(|block| !block.allocated && block.event_count > 0)
            .count()
    }

    /// Segments in address order with their blocks
    pub fn snapshot_segments(&self) -> Vec<SegmentInfo> {
        let mut segments = Vec::with_capacity(self.segments.len());
        for segment in self.segments.values() {
            let mut info = SegmentInfo {
                device: self.device,
                address: segment.ptr.0,
                total_size: segment.size,
                allocated_size: 0,
                active_size: 0,
                requested_size: 0,
                stream: segment.stream.0,
                segment_type: segment.pool,
                allocated_at_us: segment.allocated_at_us,
                frames: frames_of(&segment.context),
                blocks: Vec::new(),
            };

            let mut cursor = Some(segment.head);
            while let Some(block) = cursor.and_then(|id| self.blocks.get(&id)) {
                let state = if block.allocated {
                    BlockState::ActiveAllocated
                } else if block.event_count > 0 {
                    BlockState::ActivePendingFree
                } else {
                    BlockState::Inactive
                };
                if block.allocated {
                    info.allocated_size += block.size;
                    info.requested_size += block.requested_size;
                }
                if state != BlockState::Inactive {
                    info.active_size += block.size;
                }
                info.blocks.push(BlockInfo {
                    address: block.ptr.0,
                    size: block.size,
                    requested_size: block.requested_size,
                    state,
                    frames: frames_of(&block.context),
                });
                cursor = block.next;
            }
            segments.push(info);
        }
        segments
    }

    /// Recorded history, oldest first
    pub fn trace_entries(&self) -> Vec<TraceEntryInfo> {
        self.history
            .entries()
            .map(|entry| TraceEntryInfo {
                action: entry.action,
                address: entry.address.0,
                size: entry.size,
                stream: entry.stream.0,
                time_us: entry.time_us,
                frames: frames_of(&entry.frames),
            })
            .collect()
    }

    fn next_id(&mut self) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        id
    }

    fn block(&self, id: BlockId) -> AllocResult<&Block> {
        self.blocks.get(&id).ok_or_else(|| missing_block(id))
    }

    fn block_mut(&mut self, id: BlockId) -> AllocResult<&mut Block> {
        self.blocks.get_mut(&id).ok_or_else(|| missing_block(id))
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut BlockPool {
        match kind {
            PoolKind::Small => &mut self.small_pool,
            PoolKind::Large => &mut self.large_pool,
        }
    }

    fn device_total(&mut self) -> AllocResult<usize> {
        if let Some(total) = self.device_total {
            return Ok(total);
        }
        let (_, total) = self.backend.mem_get_info(self.device)?;
        self.device_total = Some(total);
        Ok(total)
    }

    /// Best-fit lookup; the found block is removed from its pool
    fn get_free_block(
        &mut self,
        kind: PoolKind,
        stream: StreamId,
        size: usize,
        oversize: bool,
    ) -> Option<BlockId> {
        let pool = match kind {
            PoolKind::Small => &self.small_pool,
            PoolKind::Large => &self.large_pool,
        };

        if self.config.garbage_collection_threshold > 0.0 {
            for id in pool.ids() {
                if let Some(block) = self.blocks.get_mut(&id) {
                    block.gc_count += 1;
                }
            }
        }

        let mut found = None;
        for key in pool.candidates(stream, size) {
            let Some(candidate) = self.blocks.get(&key.id) else {
                continue;
            };
            if oversize {
                // Do not hand out a much larger oversize block.
                if key.size >= size.saturating_add(LARGE_BUFFER) {
                    break;
                }
                if candidate.oversize {
                    found = Some(key.id);
                    break;
                }
            } else if !candidate.oversize {
                found = Some(key.id);
                break;
            }
        }

        let id = found?;
        let block = self.blocks.get_mut(&id)?;
        block.gc_count = 0;
        let removed = match kind {
            PoolKind::Small => self.small_pool.remove(block),
            PoolKind::Large => self.large_pool.remove(block),
        };
        debug_assert!(removed);
        tracing::trace!(
            "DeviceCachingAllocator[{}]: reusing cached block {} ({} bytes) for {} bytes",
            self.device,
            block.ptr,
            block.size,
            size
        );
        Some(id)
    }

    /// Reserve a new segment; `None` when the device or fraction cap says no
    fn alloc_segment(
        &mut self,
        segment_size: usize,
        pool: PoolKind,
        oversize: bool,
        stream: StreamId,
    ) -> AllocResult<Option<BlockId>> {
        if let Some(max) = self.allowed_memory_maximum {
            if self.total_reserved.saturating_add(segment_size) > max {
                tracing::debug!(
                    "DeviceCachingAllocator[{}]: segment of {} bytes would exceed fraction cap of {} bytes",
                    self.device,
                    segment_size,
                    max
                );
                return Ok(None);
            }
        }

        let ptr = match self.backend.reserve(segment_size, self.device) {
            Ok(ptr) => ptr,
            Err(err) if err.is_out_of_memory() => {
                tracing::debug!(
                    "DeviceCachingAllocator[{}]: device out of memory for segment of {} bytes",
                    self.device,
                    segment_size
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let id = self.next_id();
        let context = self.history.block_context();
        self.blocks.insert(
            id,
            Block::new_segment_head(id, self.device, stream, ptr, segment_size, pool, oversize),
        );
        self.segments.insert(
            ptr,
            Segment {
                device: self.device,
                ptr,
                size: segment_size,
                stream,
                pool,
                oversize,
                head: id,
                allocated_at_us: now_us(),
                context: context.clone(),
            },
        );
        self.total_reserved += segment_size;
        self.stats
            .segment_reserved(StatTypes::for_block(pool, oversize), oversize, segment_size);
        self.history.record(
            TraceAction::SegmentAlloc,
            self.device,
            ptr,
            segment_size,
            stream,
            context.as_ref(),
        );

        tracing::debug!(
            "DeviceCachingAllocator[{}]: reserved {} segment of {} bytes at {}",
            self.device,
            pool,
            segment_size,
            ptr
        );
        Ok(Some(id))
    }

    /// Flush the cache and try the reservation one more time
    fn retry_after_flush(
        &mut self,
        requested: usize,
        size: usize,
        segment_size: usize,
        pool: PoolKind,
        oversize: bool,
        stream: StreamId,
    ) -> AllocResult<BlockId> {
        self.stats.num_alloc_retries += 1;
        tracing::warn!(
            "DeviceCachingAllocator[{}]: allocation of {} bytes failed, releasing cached segments and retrying",
            self.device,
            requested
        );

        self.release_cached_blocks()?;
        if let Some(id) = self.get_free_block(pool, stream, size, oversize) {
            return Ok(id);
        }
        match self.alloc_segment(segment_size, pool, oversize, stream)? {
            Some(id) => Ok(id),
            None => Err(self.out_of_memory(requested, stream)),
        }
    }

    fn out_of_memory(&mut self, requested: usize, stream: StreamId) -> AllocatorError {
        self.stats.num_ooms += 1;
        self.history.record(
            TraceAction::Oom,
            self.device,
            DevicePtr::NULL,
            requested,
            stream,
            None,
        );

        let (free, total) = self.backend.mem_get_info(self.device).unwrap_or((0, 0));
        let allocated = self.stats.allocated_bytes[StatType::Aggregate as usize].current;
        let reserved = self.stats.reserved_bytes[StatType::Aggregate as usize].current;

        let mut message = format!(
            "Tried to allocate {} on device {}. Device has a total capacity of {} of which {} is free.",
            format_size(i64::try_from(requested).unwrap_or(i64::MAX)),
            self.device,
            format_size(total as i64),
            format_size(free as i64)
        );
        if let Some(max) = self.allowed_memory_maximum {
            message.push_str(&format!(
                " This process is limited to {} by its memory fraction.",
                format_size(max as i64)
            ));
        }
        message.push_str(&format!(
            " Of the allocated memory {} is allocated by the caching allocator, and {} is reserved but unallocated ({} segments, {} cached blocks).",
            format_size(allocated),
            format_size(reserved - allocated),
            self.segments.len(),
            self.cached_blocks()
        ));

        tracing::warn!("DeviceCachingAllocator[{}]: out of memory: {}", self.device, message);
        AllocatorError::OutOfMemory(message)
    }

    fn should_split(&self, pool: PoolKind, size: usize, remaining: usize) -> bool {
        match pool {
            PoolKind::Small => remaining >= MIN_BLOCK_SIZE,
            PoolKind::Large => size < self.config.max_split_size && remaining > SMALL_SIZE,
        }
    }

    fn alloc_found_block(
        &mut self,
        id: BlockId,
        requested: usize,
        size: usize,
    ) -> AllocResult<DevicePtr> {
        let block = self.block(id)?;
        let (block_size, pool, oversize, already_split, next) =
            (block.size, block.pool, block.oversize, block.is_split(), block.next);
        let types = StatTypes::for_block(pool, oversize);
        let remaining = block_size - size;

        if self.should_split(pool, size, remaining) {
            let remainder_id = self.next_id();
            let remainder = Block::split_from(self.block(id)?, remainder_id, size, remaining);
            if let Some(next_id) = next {
                self.block_mut(next_id)?.prev = Some(remainder_id);
            }
            let block = self.block_mut(id)?;
            block.size = size;
            block.next = Some(remainder_id);
            self.pool_mut(pool).insert(&remainder);
            self.blocks.insert(remainder_id, remainder);

            if already_split {
                // An inactive split block shrinks by the allocated head.
                self.stats.inactive_split_changed(types, 0, -(size as i64));
            } else {
                // A previously whole block now leaves an inactive remainder.
                self.stats.inactive_split_changed(types, 1, remaining as i64);
            }
            tracing::trace!(
                "DeviceCachingAllocator[{}]: split {} byte block into {} + {}",
                self.device,
                block_size,
                size,
                remaining
            );
        } else if already_split {
            self.stats
                .inactive_split_changed(types, -1, -(block_size as i64));
        }

        let context = self.history.block_context();
        let block = self.block_mut(id)?;
        block.allocated = true;
        block.requested_size = requested;
        block.context = context.clone();
        let (ptr, final_size, stream) = (block.ptr, block.size, block.stream);

        self.active_blocks.insert(ptr, id);
        self.stats.block_allocated(types, oversize, final_size, requested);
        self.history.record(
            TraceAction::Alloc,
            self.device,
            ptr,
            final_size,
            stream,
            context.as_ref(),
        );
        tracing::trace!(
            "DeviceCachingAllocator[{}]: allocated {} bytes ({} requested) at {} on stream {}",
            self.device,
            final_size,
            requested,
            ptr,
            stream
        );
        Ok(ptr)
    }

    /// Put a freed block back into its pool, merging with free neighbours
    fn free_block(&mut self, id: BlockId) -> AllocResult<()> {
        let block = self.block(id)?;
        let (pool, oversize, original_size, requested, prev, next) = (
            block.pool,
            block.oversize,
            block.size,
            block.requested_size,
            block.prev,
            block.next,
        );
        let types = StatTypes::for_block(pool, oversize);

        let mut net_blocks: i64 = 0;
        let mut net_bytes: i64 = 0;
        for neighbour in [prev, next] {
            let subsumed = self.try_merge_blocks(id, neighbour)?;
            if subsumed > 0 {
                net_blocks -= 1;
                net_bytes -= subsumed as i64;
            }
        }

        let block = self.blocks.get_mut(&id).ok_or_else(|| missing_block(id))?;
        block.requested_size = 0;
        block.context = None;
        let (ptr, size, stream, is_split) = (block.ptr, block.size, block.stream, block.is_split());
        match pool {
            PoolKind::Small => self.small_pool.insert(block),
            PoolKind::Large => self.large_pool.insert(block),
        };

        if is_split {
            net_blocks += 1;
            net_bytes += size as i64;
        }
        self.stats.inactive_split_changed(types, net_blocks, net_bytes);
        self.stats.block_reclaimed(types, original_size, requested);
        self.history.record(
            TraceAction::FreeCompleted,
            self.device,
            ptr,
            original_size,
            stream,
            None,
        );
        tracing::trace!(
            "DeviceCachingAllocator[{}]: block at {} returned to {} pool as {} bytes",
            self.device,
            ptr,
            pool,
            size
        );
        Ok(())
    }

    /// Absorb `neighbour` into `dst` if it is free; returns the absorbed size
    fn try_merge_blocks(&mut self, dst: BlockId, neighbour: Option<BlockId>) -> AllocResult<usize> {
        let Some(src_id) = neighbour else {
            return Ok(0);
        };
        let src = self.block(src_id)?;
        if !src.is_reusable() {
            return Ok(0);
        }
        let src_pool = src.pool;
        let src = self.blocks.remove(&src_id).ok_or_else(|| missing_block(src_id))?;
        self.pool_mut(src_pool).remove(&src);

        let dst_block = self.block_mut(dst)?;
        dst_block.size += src.size;
        if dst_block.prev == Some(src_id) {
            dst_block.ptr = src.ptr;
            dst_block.prev = src.prev;
            match src.prev {
                Some(prev) => self.block_mut(prev)?.next = Some(dst),
                None => {
                    if let Some(segment) = self.segments.get_mut(&src.segment) {
                        segment.head = dst;
                    }
                }
            }
        } else {
            dst_block.next = src.next;
            if let Some(next) = src.next {
                self.block_mut(next)?.prev = Some(dst);
            }
        }
        Ok(src.size)
    }

    fn event_completed(&mut self, id: BlockId) -> AllocResult<()> {
        let block = self.block_mut(id)?;
        block.event_count = block.event_count.saturating_sub(1);
        if block.event_count == 0 {
            self.free_block(id)?;
        }
        Ok(())
    }

    /// Reclaim blocks whose events have completed, without blocking
    fn process_events(&mut self) -> AllocResult<()> {
        if self.tracker.is_empty() {
            return Ok(());
        }
        for id in self.tracker.poll()? {
            self.event_completed(id)?;
        }
        Ok(())
    }

    fn synchronize_and_free_events(&mut self) -> AllocResult<()> {
        for id in self.tracker.drain()? {
            self.event_completed(id)?;
        }
        Ok(())
    }

    /// Drain pending frees, then release every unsplit cached segment
    fn release_cached_blocks(&mut self) -> AllocResult<()> {
        self.synchronize_and_free_events()?;

        let releasable: Vec<BlockId> = self
            .small_pool
            .ids()
            .chain(self.large_pool.ids())
            .filter(|id| self.blocks.get(id).is_some_and(|block| !block.is_split()))
            .collect();
        let count = releasable.len();
        for id in releasable {
            self.release_block(id)?;
        }
        if count > 0 {
            tracing::debug!(
                "DeviceCachingAllocator[{}]: released {} cached segment(s), {} bytes still reserved",
                self.device,
                count,
                self.total_reserved
            );
        }
        Ok(())
    }

    /// Return an unsplit free block's segment to the device
    fn release_block(&mut self, id: BlockId) -> AllocResult<()> {
        let block = self.block(id)?;
        debug_assert!(!block.is_split() && block.is_reusable());
        self.backend.release(block.ptr, block.size, self.device)?;

        let block = self.blocks.remove(&id).ok_or_else(|| missing_block(id))?;
        self.pool_mut(block.pool).remove(&block);
        self.segments.remove(&block.segment);
        self.total_reserved -= block.size;
        self.stats.segment_released(
            StatTypes::for_block(block.pool, block.oversize),
            block.oversize,
            block.size,
        );
        self.history.record(
            TraceAction::SegmentFree,
            self.device,
            block.ptr,
            block.size,
            block.stream,
            None,
        );
        tracing::debug!(
            "DeviceCachingAllocator[{}]: released {} segment of {} bytes at {}",
            self.device,
            block.pool,
            block.size,
            block.ptr
        );
        Ok(())
    }

    /// Release the oldest cached segments while usage is above the gc threshold
    ///
    /// Only runs once a memory fraction has set the allowed maximum.
    fn garbage_collect_cached_blocks(&mut self) -> AllocResult<()> {
        let threshold = self.config.garbage_collection_threshold;
        if threshold <= 0.0 {
            return Ok(());
        }
        let Some(allowed) = self.allowed_memory_maximum else {
            return Ok(());
        };
        let gc_threshold = (threshold * allowed as f64) as usize;
        if self.total_reserved <= gc_threshold {
            return Ok(());
        }
        let target = self.total_reserved - gc_threshold;

        let mut candidates: Vec<(usize, BlockId, usize)> = self
            .small_pool
            .ids()
            .chain(self.large_pool.ids())
            .filter_map(|id| self.blocks.get(&id))
            .filter(|block| !block.is_split())
            .map(|block| (block.gc_count, block.id, block.size))
            .collect();
        let mut total_age: usize = candidates.iter().map(|(age, _, _)| age).sum();
        let mut reclaimed = 0;
        let mut freed_any = true;

        while reclaimed < target && freed_any && !candidates.is_empty() {
            let age_threshold = total_age / candidates.len();
            freed_any = false;
            let mut younger = Vec::with_capacity(candidates.len());
            for (age, id, size) in candidates.drain(..) {
                if age >= age_threshold {
                    self.release_block(id)?;
                    freed_any = true;
                    reclaimed += size;
                    total_age -= age;
                } else {
                    younger.push((age, id, size));
                }
            }
            candidates = younger;
        }

        if reclaimed > 0 {
            tracing::debug!(
                "DeviceCachingAllocator[{}]: garbage collection reclaimed {} bytes (target {})",
                self.device,
                reclaimed,
                target
            );
        }
        Ok(())
    }
}
