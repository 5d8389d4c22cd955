//! Stream-ordered reuse: per-stream pools and deferred frees

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{all, TestAllocator, GIB, MIB};
use rocmcache::allocator::{Allocator, AllocatorConfig, BlockState, NativeCachingAllocator};
use rocmcache::backend::{
    DeviceAllocator, DeviceError, DeviceEvent, DeviceIndex, DevicePtr, DeviceResult, SimulatedDevice,
    StreamId,
};
use rocmcache::AllocatorError;

const PRODUCER: StreamId = StreamId(1);
const CONSUMER: StreamId = StreamId(2);
const OTHER: StreamId = StreamId(3);

/// Simulated device whose events on `OTHER` cannot be recorded while broken
#[derive(Debug)]
struct LossyEvents {
    inner: SimulatedDevice,
    broken: AtomicBool,
}

impl DeviceAllocator for LossyEvents {
    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn reserve(&self, size: usize, device: DeviceIndex) -> DeviceResult<DevicePtr> {
        self.inner.reserve(size, device)
    }

    fn release(&self, ptr: DevicePtr, size: usize, device: DeviceIndex) -> DeviceResult<()> {
        self.inner.release(ptr, size, device)
    }

    fn mem_get_info(&self, device: DeviceIndex) -> DeviceResult<(usize, usize)> {
        self.inner.mem_get_info(device)
    }

    fn record_event(
        &self,
        device: DeviceIndex,
        stream: StreamId,
    ) -> DeviceResult<Box<dyn DeviceEvent>> {
        if stream == OTHER && self.broken.load(Ordering::SeqCst) {
            return Err(DeviceError::EventFailed(format!("stream {} lost", stream)));
        }
        self.inner.record_event(device, stream)
    }
}

fn block_state(t: &TestAllocator, ptr: DevicePtr) -> Option<BlockState> {
    t.alloc
        .snapshot()
        .unwrap()
        .segments
        .iter()
        .flat_map(|segment| segment.blocks.iter())
        .find(|block| block.address == ptr.0)
        .map(|block| block.state)
}

#[test]
fn test_cached_block_stays_with_its_stream() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(8 * MIB, PRODUCER);
    t.free(ptr);

    let other = t.malloc_on(8 * MIB, CONSUMER);
    assert_ne!(other, ptr);
    assert_eq!(all(&t.stats().segment).current, 2);

    let same = t.malloc_on(8 * MIB, PRODUCER);
    assert_eq!(same, ptr);

    t.assert_no_leak([other, same]);
}

#[test]
fn test_free_used_by_foreign_stream_is_deferred() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(4096, PRODUCER);
    t.alloc.record_stream(ptr, CONSUMER).unwrap();
    t.device.submit_work(0, CONSUMER);
    t.free(ptr);

    assert_eq!(block_state(&t, ptr), Some(BlockState::ActivePendingFree));
    let stats = t.stats();
    assert_eq!(all(&stats.allocated_bytes).current, 0);
    assert_eq!(all(&stats.active_bytes).current, 4096);

    // Consumer still busy: the block cannot be handed out again.
    let next = t.malloc_on(4096, PRODUCER);
    assert_ne!(next, ptr);

    t.device.complete_work(0, CONSUMER);
    // The next allocation polls the event and reclaims the block.
    let reused = t.malloc_on(4096, PRODUCER);
    assert_eq!(reused, ptr);
    assert_eq!(all(&t.stats().active_bytes).current, 8192);

    t.assert_no_leak([next, reused]);
}

#[test]
fn test_own_stream_is_not_recorded() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(4096, PRODUCER);
    t.alloc.record_stream(ptr, PRODUCER).unwrap();
    t.device.submit_work(0, PRODUCER);
    t.free(ptr);

    assert_eq!(block_state(&t, ptr), Some(BlockState::Inactive));
    assert_eq!(all(&t.stats().active_bytes).current, 0);
    t.assert_no_leak([]);
}

#[test]
fn test_every_foreign_stream_must_finish() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(12 * MIB, PRODUCER);
    for stream in [CONSUMER, OTHER] {
        t.alloc.record_stream(ptr, stream).unwrap();
        t.device.submit_work(0, stream);
    }
    t.free(ptr);

    t.device.complete_work(0, CONSUMER);
    let probe = t.malloc_on(512, PRODUCER);
    assert_eq!(block_state(&t, ptr), Some(BlockState::ActivePendingFree));

    t.device.complete_work(0, OTHER);
    let probe2 = t.malloc_on(512, PRODUCER);
    assert_eq!(block_state(&t, ptr), Some(BlockState::Inactive));

    t.assert_no_leak([probe, probe2]);
}

#[test]
fn test_synchronize_reclaims_pending_frees() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(MIB, PRODUCER);
    t.alloc.record_stream(ptr, CONSUMER).unwrap();
    t.device.submit_work(0, CONSUMER);
    t.free(ptr);
    assert_eq!(block_state(&t, ptr), Some(BlockState::ActivePendingFree));

    t.alloc.synchronize().unwrap();
    assert_eq!(block_state(&t, ptr), Some(BlockState::Inactive));
    assert_eq!(all(&t.stats().active_bytes).current, 0);
    t.assert_no_leak([]);
}

#[test]
fn test_empty_cache_waits_for_pending_frees() {
    let t = TestAllocator::new(GIB);
    let ptr = t.malloc_on(16 * MIB, PRODUCER);
    t.alloc.record_stream(ptr, CONSUMER).unwrap();
    t.device.submit_work(0, CONSUMER);
    t.free(ptr);

    t.alloc.empty_cache().unwrap();
    assert_eq!(t.device.reserved_bytes(0), 0);
    assert_eq!(all(&t.stats().segment).current, 0);
}

#[test]
fn test_oom_flush_drains_pending_frees() {
    let t = TestAllocator::new(40 * MIB);
    let parked = t.malloc_on(24 * MIB, PRODUCER);
    t.alloc.record_stream(parked, CONSUMER).unwrap();
    t.device.submit_work(0, CONSUMER);
    t.free(parked);

    // Only fits once the parked segment has been waited on and released.
    let ptr = t.malloc_on(24 * MIB, CONSUMER);
    assert_eq!(t.stats().num_alloc_retries, 1);
    assert_eq!(t.stats().num_ooms, 0);
    t.assert_no_leak([ptr]);
}

#[test]
fn test_record_stream_requires_active_allocation() {
    let t = TestAllocator::new(GIB);
    assert!(matches!(
        t.alloc.record_stream(DevicePtr(0x1234), CONSUMER),
        Err(AllocatorError::InvalidPointer(_))
    ));
    let ptr = t.malloc(512);
    t.free(ptr);
    assert!(matches!(
        t.alloc.record_stream(ptr, CONSUMER),
        Err(AllocatorError::InvalidPointer(_))
    ));
    assert!(t.alloc.record_stream(DevicePtr::NULL, CONSUMER).is_ok());
}

#[test]
fn test_failed_event_record_keeps_allocation_live() {
    let device = Arc::new(LossyEvents {
        inner: SimulatedDevice::with_capacity(GIB),
        broken: AtomicBool::new(true),
    });
    let alloc = NativeCachingAllocator::new(device.clone(), AllocatorConfig::default()).unwrap();
    let ptr = alloc.raw_alloc(4096, 0, PRODUCER).unwrap();
    alloc.record_stream(ptr, CONSUMER).unwrap();
    alloc.record_stream(ptr, OTHER).unwrap();

    for _ in 0..2 {
        assert!(matches!(
            alloc.raw_delete(ptr),
            Err(AllocatorError::Device(DeviceError::EventFailed(_)))
        ));
    }
    let stats = alloc.memory_stats(0).unwrap();
    assert_eq!(all(&stats.active_bytes).current, 4096);
    assert_eq!(all(&stats.allocated).current, 1);
    let state = alloc
        .snapshot()
        .unwrap()
        .segments
        .iter()
        .flat_map(|segment| segment.blocks.iter())
        .find(|block| block.address == ptr.0)
        .map(|block| block.state);
    assert_eq!(state, Some(BlockState::ActiveAllocated));

    device.broken.store(false, Ordering::SeqCst);
    alloc.raw_delete(ptr).unwrap();
    alloc.synchronize().unwrap();
    alloc.empty_cache().unwrap();

    let stats = alloc.memory_stats(0).unwrap();
    assert_eq!(all(&stats.active_bytes).current, 0);
    assert_eq!(all(&stats.reserved_bytes).current, 0);
    assert_eq!(device.inner.reserved_bytes(0), 0);
}
