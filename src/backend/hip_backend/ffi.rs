//! HIP FFI bindings
//!
//! Only the runtime entry points the device allocator needs: device
//! selection, raw malloc/free, memory queries and stream events.

use std::ffi::c_void;

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub fn hipEventDestroy(event: *mut c_void) -> i32;
    pub fn hipEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub fn hipEventQuery(event: *mut c_void) -> i32;
    pub fn hipEventSynchronize(event: *mut c_void) -> i32;
    pub fn hipGetLastError() -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// `hipErrorOutOfMemory` (alias `hipErrorMemoryAllocation`)
pub const HIP_ERROR_OUT_OF_MEMORY: i32 = 2;

/// `hipErrorNotReady`, returned by `hipEventQuery` for pending events
pub const HIP_ERROR_NOT_READY: i32 = 600;

/// Event flag to disable timing data collection
pub const HIP_EVENT_DISABLE_TIMING: u32 = 0x1;
