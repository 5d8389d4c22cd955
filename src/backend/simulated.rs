//! Simulated device for running the allocator without a GPU
//!
//! Hands out fake, never-reused device addresses from a per-device address
//! range and enforces a fixed capacity, so out-of-memory paths can be
//! exercised deterministically. Streams are modelled as two counters: work
//! *submitted* to the stream and work *completed* by it. An event recorded on
//! a stream completes once the completed counter reaches the submitted value
//! captured at record time.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use rocmcache::backend::{DeviceAllocator, SimulatedDevice, StreamId};
//!
//! let device = Arc::new(SimulatedDevice::with_capacity(1 << 30));
//! let stream = StreamId(1);
//! device.submit_work(0, stream);
//! let event = device.record_event(0, stream).unwrap();
//! assert!(!event.query().unwrap());
//! device.complete_work(0, stream);
//! assert!(event.query().unwrap());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::device::{DeviceAllocator, DeviceEvent, DeviceIndex, DevicePtr, StreamId};
use super::error::{DeviceError, DeviceResult};

/// Start of the fake address space (device 0)
const BASE_ADDRESS: usize = 0x7f00_0000_0000;

/// Address space stride between simulated devices
const DEVICE_ADDRESS_STRIDE: usize = 0x100_0000_0000;

/// Alignment of every simulated reservation (hipMalloc guarantees at least 256)
const RESERVE_ALIGNMENT: usize = 512;

/// Work counters for one stream
#[derive(Debug, Default, Clone, Copy)]
struct StreamWork {
    submitted: u64,
    completed: u64,
}

#[derive(Debug)]
struct SimulatedState {
    total: usize,
    used: usize,
    next_address: usize,
    /// Live reservations (address -> size)
    live: HashMap<usize, usize>,
    streams: HashMap<StreamId, StreamWork>,
    reserve_calls: usize,
    release_calls: usize,
    /// Number of upcoming reservations to fail with OutOfMemory
    injected_failures: usize,
}

impl SimulatedState {
    fn new(device: DeviceIndex, total: usize) -> Self {
        Self {
            total,
            used: 0,
            next_address: BASE_ADDRESS + device * DEVICE_ADDRESS_STRIDE,
            live: HashMap::new(),
            streams: HashMap::new(),
            reserve_calls: 0,
            release_calls: 0,
            injected_failures: 0,
        }
    }
}

/// Event recorded on a simulated stream
#[derive(Debug)]
pub struct SimulatedEvent {
    state: Arc<Mutex<SimulatedState>>,
    stream: StreamId,
    target: u64,
}

impl DeviceEvent for SimulatedEvent {
    fn query(&self) -> DeviceResult<bool> {
        let state = self.state.lock()?;
        let completed = state
            .streams
            .get(&self.stream)
            .map(|work| work.completed)
            .unwrap_or(0);
        Ok(completed >= self.target)
    }

    fn synchronize(&self) -> DeviceResult<()> {
        // Waiting on the host means the stream drains up to the event.
        let mut state = self.state.lock()?;
        let work = state.streams.entry(self.stream).or_default();
        work.completed = work.completed.max(self.target);
        Ok(())
    }
}

/// In-process stand-in for one or more GPUs
#[derive(Debug)]
pub struct SimulatedDevice {
    devices: Vec<Arc<Mutex<SimulatedState>>>,
}

impl Default for SimulatedDevice {
    /// One device with 8 GiB of memory
    fn default() -> Self {
        Self::new(1, 8 << 30)
    }
}

impl SimulatedDevice {
    /// Create `device_count` devices with `total_bytes` each
    pub fn new(device_count: usize, total_bytes: usize) -> Self {
        let devices = (0..device_count)
            .map(|device| Arc::new(Mutex::new(SimulatedState::new(device, total_bytes))))
            .collect();
        Self { devices }
    }

    /// Single device with the given capacity
    pub fn with_capacity(total_bytes: usize) -> Self {
        Self::new(1, total_bytes)
    }

    fn state(&self, device: DeviceIndex) -> DeviceResult<&Arc<Mutex<SimulatedState>>> {
        self.devices
            .get(device)
            .ok_or(DeviceError::DeviceNotFound(device))
    }

    /// Enqueue one unit of work on `stream` (e.g. a kernel launch)
    pub fn submit_work(&self, device: DeviceIndex, stream: StreamId) {
        if let Ok(state) = self.state(device) {
            if let Ok(mut state) = state.lock() {
                state.streams.entry(stream).or_default().submitted += 1;
            }
        }
    }

    /// Finish all work submitted so far on `stream`
    pub fn complete_work(&self, device: DeviceIndex, stream: StreamId) {
        if let Ok(state) = self.state(device) {
            if let Ok(mut state) = state.lock() {
                let work = state.streams.entry(stream).or_default();
                work.completed = work.submitted;
            }
        }
    }

    /// Make the next `count` reservations on `device` fail with OutOfMemory
    pub fn inject_reserve_failures(&self, device: DeviceIndex, count: usize) {
        if let Ok(state) = self.state(device) {
            if let Ok(mut state) = state.lock() {
                state.injected_failures = count;
            }
        }
    }

    /// Bytes currently reserved on `device`
    pub fn reserved_bytes(&self, device: DeviceIndex) -> usize {
        self.read(device, |state| state.used)
    }

    /// Number of successful reservations on `device`
    pub fn reserve_calls(&self, device: DeviceIndex) -> usize {
        self.read(device, |state| state.reserve_calls)
    }

    /// Number of releases on `device`
    pub fn release_calls(&self, device: DeviceIndex) -> usize {
        self.read(device, |state| state.release_calls)
    }

    /// Number of live reservations on `device`
    pub fn live_regions(&self, device: DeviceIndex) -> usize {
        self.read(device, |state| state.live.len())
    }

    fn read<T: Default>(&self, device: DeviceIndex, f: impl FnOnce(&SimulatedState) -> T) -> T {
        self.state(device)
            .ok()
            .and_then(|state| state.lock().ok().map(|state| f(&state)))
            .unwrap_or_default()
    }
}

impl DeviceAllocator for SimulatedDevice {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn reserve(&self, size: usize, device: DeviceIndex) -> DeviceResult<DevicePtr> {
        let mut state = self.state(device)?.lock()?;

        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(DeviceError::OutOfMemory(format!(
                "injected failure reserving {} bytes on simulated device {}",
                size, device
            )));
        }

        if size > state.total - state.used {
            return Err(DeviceError::OutOfMemory(format!(
                "simulated device {} has {} of {} bytes free, requested {}",
                device,
                state.total - state.used,
                state.total,
                size
            )));
        }

        let address = state.next_address;
        let span = size.max(1).div_ceil(RESERVE_ALIGNMENT) * RESERVE_ALIGNMENT;
        state.next_address += span;
        state.used += size;
        state.reserve_calls += 1;
        state.live.insert(address, size);

        tracing::trace!(
            "SimulatedDevice: reserved {} bytes at 0x{:x} on device {}",
            size,
            address,
            device
        );
        Ok(DevicePtr(address))
    }

    fn release(&self, ptr: DevicePtr, size: usize, device: DeviceIndex) -> DeviceResult<()> {
        let mut state = self.state(device)?.lock()?;
        match state.live.remove(&ptr.0) {
            Some(reserved) if reserved == size => {
                state.used -= reserved;
                state.release_calls += 1;
                Ok(())
            }
            Some(reserved) => {
                // Put it back: the caller is confused about the region.
                state.live.insert(ptr.0, reserved);
                Err(DeviceError::MemoryReleaseFailed(format!(
                    "size mismatch releasing {}: reserved {} bytes, released {}",
                    ptr, reserved, size
                )))
            }
            None => Err(DeviceError::MemoryReleaseFailed(format!(
                "{} is not a live reservation on simulated device {}",
                ptr, device
            ))),
        }
    }

    fn mem_get_info(&self, device: DeviceIndex) -> DeviceResult<(usize, usize)> {
        let state = self.state(device)?.lock()?;
        Ok((state.total - state.used, state.total))
    }

    fn record_event(
        &self,
        device: DeviceIndex,
        stream: StreamId,
    ) -> DeviceResult<Box<dyn DeviceEvent>> {
        let shared = Arc::clone(self.state(device)?);
        let target = {
            let mut state = shared.lock()?;
            state.streams.entry(stream).or_default().submitted
        };
        Ok(Box::new(SimulatedEvent {
            state: shared,
            stream,
            target,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let device = SimulatedDevice::with_capacity(4096);
        let ptr = device.reserve(1024, 0).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(device.reserved_bytes(0), 1024);
        assert_eq!(device.mem_get_info(0).unwrap(), (3072, 4096));

        device.release(ptr, 1024, 0).unwrap();
        assert_eq!(device.reserved_bytes(0), 0);
        assert_eq!(device.release_calls(0), 1);
    }

    #[test]
    fn test_capacity_exhaustion_is_out_of_memory() {
        let device = SimulatedDevice::with_capacity(4096);
        device.reserve(4000, 0).unwrap();
        let err = device.reserve(200, 0).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_addresses_are_not_reused() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        let a = device.reserve(100, 0).unwrap();
        device.release(a, 100, 0).unwrap();
        let b = device.reserve(100, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.0 % RESERVE_ALIGNMENT, 0);
    }

    #[test]
    fn test_release_unknown_pointer_fails() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        let err = device.release(DevicePtr(0x10), 16, 0).unwrap_err();
        assert!(matches!(err, DeviceError::MemoryReleaseFailed(_)));
    }

    #[test]
    fn test_release_size_mismatch_keeps_reservation() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        let ptr = device.reserve(1024, 0).unwrap();
        assert!(device.release(ptr, 512, 0).is_err());
        assert_eq!(device.live_regions(0), 1);
        device.release(ptr, 1024, 0).unwrap();
    }

    #[test]
    fn test_injected_failures() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        device.inject_reserve_failures(0, 1);
        assert!(device.reserve(16, 0).unwrap_err().is_out_of_memory());
        assert!(device.reserve(16, 0).is_ok());
    }

    #[test]
    fn test_unknown_device() {
        let device = SimulatedDevice::new(2, 1 << 20);
        assert_eq!(device.device_count(), 2);
        assert_eq!(
            device.reserve(16, 2).unwrap_err(),
            DeviceError::DeviceNotFound(2)
        );
    }

    #[test]
    fn test_event_tracks_stream_work() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        let stream = StreamId(7);

        // Nothing submitted: event completes immediately
        let idle = device.record_event(0, stream).unwrap();
        assert!(idle.query().unwrap());

        device.submit_work(0, stream);
        let busy = device.record_event(0, stream).unwrap();
        assert!(!busy.query().unwrap());

        // Work submitted after the record does not hold the event back
        device.complete_work(0, stream);
        device.submit_work(0, stream);
        assert!(busy.query().unwrap());
    }

    #[test]
    fn test_event_synchronize_drains_stream() {
        let device = SimulatedDevice::with_capacity(1 << 20);
        let stream = StreamId(3);
        device.submit_work(0, stream);
        let event = device.record_event(0, stream).unwrap();
        event.synchronize().unwrap();
        assert!(event.query().unwrap());
    }

    #[test]
    fn test_devices_have_disjoint_addresses() {
        let device = SimulatedDevice::new(2, 1 << 20);
        let a = device.reserve(64, 0).unwrap();
        let b = device.reserve(64, 1).unwrap();
        assert!(b.0 >= a.0 + DEVICE_ADDRESS_STRIDE);
    }
}
