//! hipMalloc-backed device allocator

use std::ptr;
use std::sync::Mutex;

use super::event::HipEvent;
use super::ffi;
use crate::backend::device::{DeviceAllocator, DeviceEvent, DeviceIndex, DevicePtr, StreamId};
use crate::backend::error::{DeviceError, DeviceResult};

/// Raw HIP device memory
///
/// Every call first selects the target device; the selection is serialized
/// so two threads driving different devices cannot interleave
/// `hipSetDevice` and the call that depends on it.
#[derive(Debug)]
pub struct HipDeviceAllocator {
    device_count: usize,
    device_guard: Mutex<()>,
}

impl HipDeviceAllocator {
    /// Initialize the HIP runtime and count devices
    pub fn new() -> DeviceResult<Self> {
        let result = unsafe { ffi::hipInit(0) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::InitializationFailed(format!(
                "hipInit failed with code {}",
                result
            )));
        }

        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::InitializationFailed(format!(
                "hipGetDeviceCount failed with code {}",
                result
            )));
        }

        tracing::info!("HipDeviceAllocator: {} HIP device(s) available", count);
        Ok(Self {
            device_count: count.max(0) as usize,
            device_guard: Mutex::new(()),
        })
    }

    fn with_device<T>(
        &self,
        device: DeviceIndex,
        f: impl FnOnce() -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        if device >= self.device_count {
            return Err(DeviceError::DeviceNotFound(device));
        }
        let _guard = self.device_guard.lock()?;
        let result = unsafe { ffi::hipSetDevice(device as i32) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::InitializationFailed(format!(
                "hipSetDevice({}) failed with code {}",
                device, result
            )));
        }
        f()
    }
}

impl DeviceAllocator for HipDeviceAllocator {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn reserve(&self, size: usize, device: DeviceIndex) -> DeviceResult<DevicePtr> {
        self.with_device(device, || {
            let mut ptr: *mut std::ffi::c_void = ptr::null_mut();
            tracing::trace!("HipDeviceAllocator: hipMalloc {} bytes on device {}", size, device);
            let result = unsafe { ffi::hipMalloc(&mut ptr, size) };

            if result == ffi::HIP_ERROR_OUT_OF_MEMORY {
                // Clear the sticky error; the caller will flush and retry.
                unsafe { ffi::hipGetLastError() };
                return Err(DeviceError::OutOfMemory(format!(
                    "hipMalloc of {} bytes on device {} returned hipErrorOutOfMemory",
                    size, device
                )));
            }
            if result != ffi::HIP_SUCCESS {
                tracing::error!(
                    "HipDeviceAllocator: hipMalloc failed with code {} for {} bytes",
                    result,
                    size
                );
                return Err(DeviceError::MemoryAllocationFailed(format!(
                    "hipMalloc failed with code {} for {} bytes",
                    result, size
                )));
            }
            if ptr.is_null() {
                return Err(DeviceError::MemoryAllocationFailed(format!(
                    "hipMalloc returned null pointer for {} bytes",
                    size
                )));
            }
            Ok(DevicePtr::from_raw(ptr))
        })
    }

    fn release(&self, ptr: DevicePtr, size: usize, device: DeviceIndex) -> DeviceResult<()> {
        self.with_device(device, || {
            let result = unsafe { ffi::hipFree(ptr.as_mut_ptr()) };
            if result != ffi::HIP_SUCCESS {
                return Err(DeviceError::MemoryReleaseFailed(format!(
                    "hipFree({}) of {} bytes failed with code {}",
                    ptr, size, result
                )));
            }
            Ok(())
        })
    }

    fn mem_get_info(&self, device: DeviceIndex) -> DeviceResult<(usize, usize)> {
        self.with_device(device, || {
            let mut free: usize = 0;
            let mut total: usize = 0;
            let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
            if result != ffi::HIP_SUCCESS {
                return Err(DeviceError::MemoryQueryFailed(format!(
                    "hipMemGetInfo failed with code {}",
                    result
                )));
            }
            Ok((free, total))
        })
    }

    fn record_event(
        &self,
        device: DeviceIndex,
        stream: StreamId,
    ) -> DeviceResult<Box<dyn DeviceEvent>> {
        self.with_device(device, || {
            let event = HipEvent::record_on(stream)?;
            Ok(Box::new(event) as Box<dyn DeviceEvent>)
        })
    }
}
