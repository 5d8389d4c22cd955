//! Device allocator collaborator
//!
//! The caching allocator never talks to the driver directly. Everything it
//! needs from a device (reserving and releasing raw memory, querying
//! capacity, and fencing streams with events) goes through the
//! [`DeviceAllocator`] trait defined here.

use std::fmt;

use super::error::DeviceResult;

/// Device index, as used by `hipSetDevice`
pub type DeviceIndex = usize;

/// Address of device memory
///
/// Stored as an integer so it can key maps and be ordered; convert with
/// [`DevicePtr::as_mut_ptr`] at FFI boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    /// The null device pointer
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }

    pub fn as_mut_ptr(&self) -> *mut std::ffi::c_void {
        self.0 as *mut std::ffi::c_void
    }

    pub fn from_raw(ptr: *mut std::ffi::c_void) -> Self {
        DevicePtr(ptr as usize)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Opaque stream handle (the raw `hipStream_t` value)
///
/// `StreamId::DEFAULT` is the null stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub usize);

impl StreamId {
    pub const DEFAULT: StreamId = StreamId(0);

    pub fn as_mut_ptr(&self) -> *mut std::ffi::c_void {
        self.0 as *mut std::ffi::c_void
    }

    pub fn from_raw(stream: *mut std::ffi::c_void) -> Self {
        StreamId(stream as usize)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A marker recorded into a stream
///
/// Completes once all work submitted to the stream before the record has
/// finished executing.
pub trait DeviceEvent: Send + fmt::Debug {
    /// Non-blocking completion check
    fn query(&self) -> DeviceResult<bool>;

    /// Block the host until the event has completed
    fn synchronize(&self) -> DeviceResult<()>;
}

/// Raw memory source beneath the caching allocator
///
/// Implementations must be thread-safe; the caching allocator serializes
/// calls per device but different devices may be driven concurrently.
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    /// Number of devices this allocator can address
    fn device_count(&self) -> usize;

    /// Reserve `size` bytes on `device`
    ///
    /// Must return [`DeviceError::OutOfMemory`](super::DeviceError::OutOfMemory)
    /// when the failure is a lack of memory, so the caller can flush its
    /// cache and retry.
    fn reserve(&self, size: usize, device: DeviceIndex) -> DeviceResult<DevicePtr>;

    /// Return a region obtained from [`DeviceAllocator::reserve`]
    fn release(&self, ptr: DevicePtr, size: usize, device: DeviceIndex) -> DeviceResult<()>;

    /// `(free_bytes, total_bytes)` as reported by the device
    fn mem_get_info(&self, device: DeviceIndex) -> DeviceResult<(usize, usize)>;

    /// Record an event capturing the current tail of `stream`
    fn record_event(
        &self,
        device: DeviceIndex,
        stream: StreamId,
    ) -> DeviceResult<Box<dyn DeviceEvent>>;
}
