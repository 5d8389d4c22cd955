//! Public device-memory API
//!
//! Free functions over the process-wide [`AllocatorRegistry`]. Allocation
//! builds the active allocator on first use and freezes configuration;
//! queries made before that report an empty allocator instead of
//! initializing one.
//!
//! Every query is also available as a method on [`AllocatorRegistry`], so
//! tools can drive a private registry over a simulated device.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::allocator::{Allocator, DeviceStats, HistoryOptions, MemorySnapshot, StatType};
use crate::backend::{DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};
use crate::registry::{self, AllocatorRegistry};

impl AllocatorRegistry {
    fn check_device(&self, device: DeviceIndex) -> AllocResult<()> {
        let count = self.device().device_count();
        if device >= count {
            return Err(AllocatorError::InvalidArgument(format!(
                "device index {} out of range, {} device(s) available",
                device, count
            )));
        }
        Ok(())
    }

    /// Allocate `size` bytes; negative sizes are rejected, zero gives NULL
    pub fn allocate(&self, size: i64, device: DeviceIndex, stream: StreamId) -> AllocResult<DevicePtr> {
        let size = usize::try_from(size).map_err(|_| {
            AllocatorError::InvalidArgument(format!("allocation size must be non-negative, got {}", size))
        })?;
        self.check_device(device)?;
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        self.active()?.raw_alloc(size, device, stream)
    }

    pub fn deallocate(&self, ptr: DevicePtr) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.current() {
            Some(active) => active.raw_delete(ptr),
            None => Err(AllocatorError::InvalidPointer(format!(
                "{} freed before any allocation was made",
                ptr
            ))),
        }
    }

    pub fn record_stream(&self, ptr: DevicePtr, stream: StreamId) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.current() {
            Some(active) => active.record_stream(ptr, stream),
            None => Err(AllocatorError::InvalidPointer(format!(
                "{} is not an active allocation",
                ptr
            ))),
        }
    }

    pub fn empty_cache(&self) -> AllocResult<()> {
        match self.current() {
            Some(active) => active.empty_cache(),
            None => Ok(()),
        }
    }

    pub fn synchronize(&self) -> AllocResult<()> {
        match self.current() {
            Some(active) => active.synchronize(),
            None => Ok(()),
        }
    }

    /// Statistics of `device`, or `None` while nothing has been allocated
    pub fn device_stats(&self, device: DeviceIndex) -> AllocResult<Option<DeviceStats>> {
        self.check_device(device)?;
        match self.current() {
            Some(active) => active.memory_stats(device).map(Some),
            None => Ok(None),
        }
    }

    pub fn memory_stats(&self, device: DeviceIndex) -> AllocResult<BTreeMap<String, i64>> {
        Ok(self
            .device_stats(device)?
            .map(|stats| stats.to_flat())
            .unwrap_or_default())
    }

    pub fn memory_stats_as_nested_dict(&self, device: DeviceIndex) -> AllocResult<Value> {
        Ok(self
            .device_stats(device)?
            .map(|stats| stats.to_nested())
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    fn aggregate<F>(&self, device: DeviceIndex, pick: F) -> AllocResult<i64>
    where
        F: Fn(&DeviceStats) -> i64,
    {
        Ok(self.device_stats(device)?.map(|stats| pick(&stats)).unwrap_or(0))
    }

    pub fn memory_allocated(&self, device: DeviceIndex) -> AllocResult<i64> {
        self.aggregate(device, |s| s.allocated_bytes[StatType::Aggregate as usize].current)
    }

    pub fn max_memory_allocated(&self, device: DeviceIndex) -> AllocResult<i64> {
        self.aggregate(device, |s| s.allocated_bytes[StatType::Aggregate as usize].peak)
    }

    pub fn memory_reserved(&self, device: DeviceIndex) -> AllocResult<i64> {
        self.aggregate(device, |s| s.reserved_bytes[StatType::Aggregate as usize].current)
    }

    pub fn max_memory_reserved(&self, device: DeviceIndex) -> AllocResult<i64> {
        self.aggregate(device, |s| s.reserved_bytes[StatType::Aggregate as usize].peak)
    }

    pub fn reset_peak_memory_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.check_device(device)?;
        match self.current() {
            Some(active) => active.reset_peak_stats(device),
            None => Ok(()),
        }
    }

    pub fn reset_accumulated_memory_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.check_device(device)?;
        match self.current() {
            Some(active) => active.reset_accumulated_stats(device),
            None => Ok(()),
        }
    }

    /// Segments of every device plus per-device traces
    pub fn memory_snapshot(&self) -> AllocResult<MemorySnapshot> {
        match self.current() {
            Some(active) => active.snapshot(),
            None => Ok(MemorySnapshot::default()),
        }
    }

    /// `(free, total)` bytes as reported by the device
    pub fn mem_get_info(&self, device: DeviceIndex) -> AllocResult<(usize, usize)> {
        self.check_device(device)?;
        Ok(self.device().mem_get_info(device)?)
    }
}

/// Read `ROCMCACHE_ALLOC_CONF` now so malformed settings surface early
pub fn init() -> AllocResult<()> {
    registry::global().init()
}

/// Allocate `size` bytes on `device` for use on `stream`
///
/// # Errors
/// - [`AllocatorError::InvalidArgument`] for a negative size or unknown device
/// - [`AllocatorError::OutOfMemory`] once the cache flush retry has failed
pub fn caching_allocator_alloc(size: i64, device: DeviceIndex, stream: StreamId) -> AllocResult<DevicePtr> {
    registry::global().allocate(size, device, stream)
}

/// Free memory returned by [`caching_allocator_alloc`]
pub fn caching_allocator_delete(ptr: DevicePtr) -> AllocResult<()> {
    registry::global().deallocate(ptr)
}

/// Mark `ptr` as used by `stream`; its memory is not reused until that
/// stream's work queued so far has completed
pub fn record_stream(ptr: DevicePtr, stream: StreamId) -> AllocResult<()> {
    registry::global().record_stream(ptr, stream)
}

/// Cap the bytes this process may reserve on `device` at `fraction` of its capacity
pub fn set_per_process_memory_fraction(fraction: f64, device: DeviceIndex) -> AllocResult<()> {
    registry::global().set_memory_fraction(fraction, device)
}

/// Release every cached segment that holds no live allocation
pub fn empty_cache() -> AllocResult<()> {
    registry::global().empty_cache()
}

/// Wait for every deferred free and return those blocks to the cache
pub fn synchronize() -> AllocResult<()> {
    registry::global().synchronize()
}

/// Flat `metric.partition.field` statistics, empty before first use
pub fn memory_stats(device: DeviceIndex) -> AllocResult<BTreeMap<String, i64>> {
    registry::global().memory_stats(device)
}

pub fn memory_stats_as_nested_dict(device: DeviceIndex) -> AllocResult<Value> {
    registry::global().memory_stats_as_nested_dict(device)
}

/// Bytes currently handed out to callers
pub fn memory_allocated(device: DeviceIndex) -> AllocResult<i64> {
    registry::global().memory_allocated(device)
}

pub fn max_memory_allocated(device: DeviceIndex) -> AllocResult<i64> {
    registry::global().max_memory_allocated(device)
}

/// Bytes reserved from the device, cached or not
pub fn memory_reserved(device: DeviceIndex) -> AllocResult<i64> {
    registry::global().memory_reserved(device)
}

pub fn max_memory_reserved(device: DeviceIndex) -> AllocResult<i64> {
    registry::global().max_memory_reserved(device)
}

/// Zero the allocated/freed counters, retries and OOMs
pub fn reset_accumulated_memory_stats(device: DeviceIndex) -> AllocResult<()> {
    registry::global().reset_accumulated_memory_stats(device)
}

/// Set every peak to its current value
pub fn reset_peak_memory_stats(device: DeviceIndex) -> AllocResult<()> {
    registry::global().reset_peak_memory_stats(device)
}

#[deprecated(note = "resets all peaks; use reset_peak_memory_stats")]
pub fn reset_max_memory_allocated(device: DeviceIndex) -> AllocResult<()> {
    reset_peak_memory_stats(device)
}

#[deprecated(note = "resets all peaks; use reset_peak_memory_stats")]
pub fn reset_max_memory_cached(device: DeviceIndex) -> AllocResult<()> {
    reset_peak_memory_stats(device)
}

pub fn memory_snapshot() -> AllocResult<MemorySnapshot> {
    registry::global().memory_snapshot()
}

pub fn mem_get_info(device: DeviceIndex) -> AllocResult<(usize, usize)> {
    registry::global().mem_get_info(device)
}

/// `"native"`, `"pluggable"` or the name of an installed custom allocator
pub fn get_allocator_backend() -> AllocResult<String> {
    registry::global().backend_name()
}

/// Replace the allocator; only possible before the first allocation
pub fn change_current_allocator(allocator: Arc<dyn Allocator>) -> AllocResult<()> {
    registry::global().change_current_allocator(allocator)
}

/// Apply a `key:value,...` settings string before the first allocation
pub fn set_allocator_settings(settings: &str) -> AllocResult<()> {
    registry::global().set_allocator_settings(settings)
}

/// Start or stop recording allocator history
///
/// `enabled` is `None` (off), `"state"` or `"all"`; `context` chooses
/// which events capture a backtrace.
pub fn record_memory_history(
    enabled: Option<&str>,
    context: Option<&str>,
    max_entries: usize,
) -> AllocResult<()> {
    registry::global().record_history(HistoryOptions::parse(enabled, context, max_entries)?)
}

/// Boolean form of [`record_memory_history`]: everything with backtraces, or off
#[deprecated(note = "use record_memory_history with string options")]
pub fn record_memory_history_legacy(enabled: bool, max_entries: usize) -> AllocResult<()> {
    let options = if enabled {
        HistoryOptions::all(max_entries)
    } else {
        HistoryOptions::off()
    };
    registry::global().record_history(options)
}
