//! Allocator fixtures over the simulated device

use std::sync::Arc;

use rocmcache::allocator::{
    Allocator, AllocatorConfig, DeviceStats, NativeCachingAllocator, Stat, StatArray, StatType,
};
use rocmcache::backend::{DevicePtr, SimulatedDevice, StreamId};
use rocmcache::registry::AllocatorRegistry;

pub const KIB: usize = 1 << 10;
pub const MIB: usize = 1 << 20;
pub const GIB: usize = 1 << 30;

/// A native allocator plus a handle on the device behind it
pub struct TestAllocator {
    pub device: Arc<SimulatedDevice>,
    pub alloc: NativeCachingAllocator,
}

impl TestAllocator {
    /// Single device of `capacity` bytes, default configuration
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, AllocatorConfig::default())
    }

    pub fn with_config(capacity: usize, config: AllocatorConfig) -> Self {
        let device = Arc::new(SimulatedDevice::with_capacity(capacity));
        let alloc = NativeCachingAllocator::new(device.clone(), config)
            .expect("allocator config should be valid");
        Self { device, alloc }
    }

    pub fn malloc(&self, size: usize) -> DevicePtr {
        self.malloc_on(size, StreamId::DEFAULT)
    }

    pub fn malloc_on(&self, size: usize, stream: StreamId) -> DevicePtr {
        self.alloc
            .raw_alloc(size, 0, stream)
            .unwrap_or_else(|err| panic!("allocation of {} bytes failed: {}", size, err))
    }

    pub fn free(&self, ptr: DevicePtr) {
        self.alloc
            .raw_delete(ptr)
            .unwrap_or_else(|err| panic!("free of {} failed: {}", ptr, err));
    }

    pub fn stats(&self) -> DeviceStats {
        self.alloc.memory_stats(0).expect("stats of device 0")
    }

    /// Free everything given, drain the cache and check nothing is left behind
    pub fn assert_no_leak(&self, live: impl IntoIterator<Item = DevicePtr>) {
        for ptr in live {
            self.free(ptr);
        }
        self.alloc.synchronize().expect("synchronize");
        self.alloc.empty_cache().expect("empty_cache");

        let stats = self.stats();
        assert_eq!(all(&stats.allocated_bytes).current, 0, "allocated bytes leaked");
        assert_eq!(all(&stats.active_bytes).current, 0, "active bytes leaked");
        assert_eq!(all(&stats.reserved_bytes).current, 0, "reserved bytes leaked");
        assert_eq!(self.device.reserved_bytes(0), 0, "device regions leaked");
    }
}

/// The aggregate partition of a stat array
pub fn all(array: &StatArray) -> Stat {
    array[StatType::Aggregate as usize]
}

pub fn small(array: &StatArray) -> Stat {
    array[StatType::SmallPool as usize]
}

pub fn large(array: &StatArray) -> Stat {
    array[StatType::LargePool as usize]
}

/// Private registry over a single simulated device with default settings
pub fn local_registry(capacity: usize) -> (Arc<SimulatedDevice>, AllocatorRegistry) {
    let device = Arc::new(SimulatedDevice::with_capacity(capacity));
    let registry = AllocatorRegistry::new(device.clone());
    registry
        .configure(AllocatorConfig::default())
        .expect("default config is valid");
    (device, registry)
}
