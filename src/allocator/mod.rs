//! Caching allocator core
//!
//! - [`block`]: segments and the blocks carved from them
//! - [`pool`]: best-fit free block pools
//! - [`stream_tracker`]: deferred reuse of blocks touched by other streams
//! - [`device_cache`]: the per-device allocator
//! - [`native`]: the multi-device allocator behind per-device locks
//! - [`stats`], [`history`], [`snapshot`]: diagnostics
//!
//! Every allocator implementation, built-in or loaded, is driven through
//! the [`Allocator`] trait.

pub mod block;
pub mod config;
pub mod device_cache;
pub mod history;
pub mod native;
pub mod pool;
pub mod snapshot;
pub mod stats;
pub mod stream_tracker;

pub use block::{Block, BlockId, PoolKind, Segment};
pub use config::{AllocatorConfig, BackendKind, ALLOC_CONF_ENV};
pub use device_cache::DeviceCachingAllocator;
pub use history::{ContextScope, HistoryOptions, RecordScope, TraceAction, TraceEntry};
pub use native::NativeCachingAllocator;
pub use pool::BlockPool;
pub use snapshot::{BlockInfo, BlockState, MemorySnapshot, SegmentInfo, TraceEntryInfo};
pub use stats::{DeviceStats, Stat, StatArray, StatType};
pub use stream_tracker::StreamTracker;

use std::fmt;

use crate::backend::{DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};

/// A device memory allocator that can be installed process-wide
///
/// `raw_alloc` and `raw_delete` are mandatory; diagnostics may be
/// unsupported and then return [`AllocatorError::Unsupported`].
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Backend name reported by `get_allocator_backend`
    fn name(&self) -> &str;

    /// Allocate `size` bytes on `device` for use on `stream`
    ///
    /// A zero-byte request returns [`DevicePtr::NULL`].
    fn raw_alloc(&self, size: usize, device: DeviceIndex, stream: StreamId)
        -> AllocResult<DevicePtr>;

    /// Release an allocation; the null pointer is ignored
    fn raw_delete(&self, ptr: DevicePtr) -> AllocResult<()>;

    /// Mark an allocation as used by `stream`
    fn record_stream(&self, ptr: DevicePtr, stream: StreamId) -> AllocResult<()>;

    /// Return cached, unused memory to the device
    fn empty_cache(&self) -> AllocResult<()>;

    /// Cap this process's reservations on `device`
    fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> AllocResult<()>;

    fn memory_stats(&self, device: DeviceIndex) -> AllocResult<DeviceStats>;

    fn reset_peak_stats(&self, device: DeviceIndex) -> AllocResult<()>;

    fn reset_accumulated_stats(&self, device: DeviceIndex) -> AllocResult<()>;

    fn snapshot(&self) -> AllocResult<MemorySnapshot>;

    fn record_history(&self, options: &HistoryOptions) -> AllocResult<()>;

    /// Wait for deferred frees to complete
    fn synchronize(&self) -> AllocResult<()>;
}

/// Reject fractions outside `[0, 1]` (including NaN)
pub fn validate_fraction(fraction: f64) -> AllocResult<()> {
    if (0.0..=1.0).contains(&fraction) {
        Ok(())
    } else {
        Err(AllocatorError::InvalidArgument(format!(
            "memory fraction must be within [0, 1], got {}",
            fraction
        )))
    }
}
