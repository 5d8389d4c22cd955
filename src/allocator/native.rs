//! Built-in multi-device caching allocator

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::config::AllocatorConfig;
use super::device_cache::DeviceCachingAllocator;
use super::history::HistoryOptions;
use super::snapshot::MemorySnapshot;
use super::stats::DeviceStats;
use super::Allocator;
use crate::backend::{DeviceAllocator, DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};

/// One [`DeviceCachingAllocator`] per device, each behind its own mutex
///
/// A separate mutex maps live pointers to their device. It is never held
/// while a device lock is taken.
#[derive(Debug)]
pub struct NativeCachingAllocator {
    backend: Arc<dyn DeviceAllocator>,
    config: Arc<AllocatorConfig>,
    devices: Vec<Mutex<DeviceCachingAllocator>>,
    allocated_ptrs: Mutex<HashMap<DevicePtr, DeviceIndex>>,
}

impl NativeCachingAllocator {
    pub fn new(backend: Arc<dyn DeviceAllocator>, config: AllocatorConfig) -> AllocResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let devices = (0..backend.device_count())
            .map(|device| {
                Mutex::new(DeviceCachingAllocator::new(
                    device,
                    Arc::clone(&backend),
                    Arc::clone(&config),
                ))
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "NativeCachingAllocator: {} device(s), max_split_size={}, roundup_power2_divisions={}, gc_threshold={}",
            devices.len(),
            config.max_split_size,
            config.roundup_power2_divisions,
            config.garbage_collection_threshold
        );

        Ok(Self {
            backend,
            config,
            devices,
            allocated_ptrs: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn DeviceAllocator> {
        &self.backend
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, device: DeviceIndex) -> AllocResult<&Mutex<DeviceCachingAllocator>> {
        self.devices.get(device).ok_or_else(|| {
            AllocatorError::InvalidArgument(format!(
                "device index {} out of range, {} device(s) available",
                device,
                self.devices.len()
            ))
        })
    }

    fn device_of(&self, ptr: DevicePtr) -> AllocResult<DeviceIndex> {
        self.allocated_ptrs
            .lock()?
            .get(&ptr)
            .copied()
            .ok_or_else(|| AllocatorError::InvalidPointer(format!("{} was not allocated here", ptr)))
    }

    /// Bytes reserved on `device`
    pub fn reserved_bytes(&self, device: DeviceIndex) -> AllocResult<usize> {
        Ok(self.device(device)?.lock()?.reserved_bytes())
    }
}

impl Allocator for NativeCachingAllocator {
    fn name(&self) -> &str {
        "native"
    }

    fn raw_alloc(
        &self,
        size: usize,
        device: DeviceIndex,
        stream: StreamId,
    ) -> AllocResult<DevicePtr> {
        let cache = self.device(device)?;
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let ptr = cache.lock()?.malloc(size, stream)?;
        self.allocated_ptrs.lock()?.insert(ptr, device);
        Ok(ptr)
    }

    fn raw_delete(&self, ptr: DevicePtr) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let device = self
            .allocated_ptrs
            .lock()?
            .remove(&ptr)
            .ok_or_else(|| AllocatorError::InvalidPointer(format!("{} was not allocated here", ptr)))?;
        let freed = self
            .device(device)
            .and_then(|cache| cache.lock()?.free(ptr));
        if freed.is_err() {
            // The block is still live, so the caller may free it again.
            self.allocated_ptrs.lock()?.insert(ptr, device);
        }
        freed
    }

    fn record_stream(&self, ptr: DevicePtr, stream: StreamId) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let device = self.device_of(ptr)?;
        self.device(device)?.lock()?.record_stream(ptr, stream)
    }

    fn empty_cache(&self) -> AllocResult<()> {
        for cache in &self.devices {
            cache.lock()?.empty_cache()?;
        }
        Ok(())
    }

    fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> AllocResult<()> {
        super::validate_fraction(fraction)?;
        self.device(device)?.lock()?.set_memory_fraction(fraction)
    }

    fn memory_stats(&self, device: DeviceIndex) -> AllocResult<DeviceStats> {
        Ok(self.device(device)?.lock()?.stats().clone())
    }

    fn reset_peak_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.device(device)?.lock()?.reset_peak_stats();
        Ok(())
    }

    fn reset_accumulated_stats(&self, device: DeviceIndex) -> AllocResult<()> {
        self.device(device)?.lock()?.reset_accumulated_stats();
        Ok(())
    }

    fn snapshot(&self) -> AllocResult<MemorySnapshot> {
        let mut snapshot = MemorySnapshot::default();
        for cache in &self.devices {
            let cache = cache.lock()?;
            snapshot.segments.extend(cache.snapshot_segments());
            snapshot.device_traces.push(cache.trace_entries());
        }
        Ok(snapshot)
    }

    fn record_history(&self, options: &HistoryOptions) -> AllocResult<()> {
        options.validate()?;
        for cache in &self.devices {
            cache.lock()?.record_history(options.clone());
        }
        Ok(())
    }

    fn synchronize(&self) -> AllocResult<()> {
        for cache in &self.devices {
            cache.lock()?.synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::stats::StatType;
    use crate::backend::SimulatedDevice;
    use std::thread;

    fn allocator(devices: usize) -> NativeCachingAllocator {
        let backend = Arc::new(SimulatedDevice::new(devices, 1 << 30));
        NativeCachingAllocator::new(backend, AllocatorConfig::default()).unwrap()
    }

    #[test]
    fn test_zero_size_returns_null() {
        let alloc = allocator(1);
        let ptr = alloc.raw_alloc(0, 0, StreamId::DEFAULT).unwrap();
        assert!(ptr.is_null());
        alloc.raw_delete(ptr).unwrap();
        let stats = alloc.memory_stats(0).unwrap();
        assert_eq!(stats.segment[StatType::Aggregate as usize].allocated, 0);
    }

    #[test]
    fn test_device_out_of_range() {
        let alloc = allocator(1);
        assert!(matches!(
            alloc.raw_alloc(512, 3, StreamId::DEFAULT),
            Err(AllocatorError::InvalidArgument(_))
        ));
        assert!(alloc.set_memory_fraction(0.5, 3).is_err());
        assert!(alloc.memory_stats(1).is_err());
    }

    #[test]
    fn test_pointer_routed_to_owning_device() {
        let alloc = allocator(2);
        let on_zero = alloc.raw_alloc(512, 0, StreamId::DEFAULT).unwrap();
        let on_one = alloc.raw_alloc(512, 1, StreamId::DEFAULT).unwrap();
        alloc.raw_delete(on_one).unwrap();
        assert_eq!(
            alloc.memory_stats(1).unwrap().allocated[StatType::Aggregate as usize].current,
            0
        );
        assert_eq!(
            alloc.memory_stats(0).unwrap().allocated[StatType::Aggregate as usize].current,
            1
        );
        alloc.raw_delete(on_zero).unwrap();
    }

    #[test]
    fn test_unknown_pointer() {
        let alloc = allocator(1);
        assert!(matches!(
            alloc.raw_delete(DevicePtr(0xdead)),
            Err(AllocatorError::InvalidPointer(_))
        ));
        assert!(matches!(
            alloc.record_stream(DevicePtr(0xdead), StreamId(1)),
            Err(AllocatorError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_invalid_history_options_rejected() {
        let alloc = allocator(1);
        let options = HistoryOptions {
            max_entries: 0,
            ..HistoryOptions::all(1)
        };
        assert!(alloc.record_history(&options).is_err());
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let alloc = Arc::new(allocator(2));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let device = t % 2;
                    let stream = StreamId(t);
                    for i in 0..200 {
                        let size = 256 + (i * 97 + t * 13) % (3 << 20);
                        let ptr = alloc.raw_alloc(size, device, stream).unwrap();
                        alloc.raw_delete(ptr).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for device in 0..2 {
            let stats = alloc.memory_stats(device).unwrap();
            assert_eq!(stats.allocated[StatType::Aggregate as usize].current, 0);
            assert_eq!(stats.allocated[StatType::Aggregate as usize].allocated, 800);
            assert_eq!(stats.active_bytes[StatType::Aggregate as usize].current, 0);
        }
        alloc.empty_cache().unwrap();
        assert_eq!(alloc.reserved_bytes(0).unwrap(), 0);
        assert_eq!(alloc.reserved_bytes(1).unwrap(), 0);
    }
}
