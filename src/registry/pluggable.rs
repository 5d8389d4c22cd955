//! Custom allocator loaded from a shared object
//!
//! A pluggable backend is two C entry points:
//!
//! ```c
//! void* my_alloc(ssize_t size, int device, void* stream);
//! void  my_free(void* ptr, size_t size, void* stream);
//! ```
//!
//! Requests are forwarded verbatim. The only bookkeeping kept here is the
//! size and stream of each live pointer, which `free` needs. Statistics,
//! snapshots and memory fractions are not available through this backend.

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::path::Path;
use std::sync::Mutex;

use crate::allocator::{Allocator, DeviceStats, HistoryOptions, MemorySnapshot};
use crate::backend::{DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};

/// `void* alloc(ssize_t size, int device, void* stream)`
pub type RawAllocFn = unsafe extern "C" fn(size: isize, device: i32, stream: *mut c_void) -> *mut c_void;

/// `void free(void* ptr, size_t size, void* stream)`
pub type RawFreeFn = unsafe extern "C" fn(ptr: *mut c_void, size: usize, stream: *mut c_void);

const BACKEND_NAME: &str = "pluggable";

/// Open `dlopen` handle, closed on drop
#[derive(Debug)]
struct LibraryHandle(*mut c_void);

// SAFETY: a dlopen handle is a process-global token; dlsym and dlclose may
// be called on it from any thread.
unsafe impl Send for LibraryHandle {}
unsafe impl Sync for LibraryHandle {}

impl LibraryHandle {
    fn open(path: &Path) -> AllocResult<Self> {
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            AllocatorError::BackendLoadError(format!(
                "library path {} contains a NUL byte",
                path.display()
            ))
        })?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(AllocatorError::BackendLoadError(format!(
                "cannot open {}: {}",
                path.display(),
                last_dl_error()
            )));
        }
        Ok(Self(handle))
    }

    fn symbol(&self, name: &str) -> AllocResult<*mut c_void> {
        let c_name = CString::new(name).map_err(|_| {
            AllocatorError::BackendLoadError(format!("symbol name {:?} contains a NUL byte", name))
        })?;
        // SAFETY: self.0 is a live handle from dlopen and c_name is NUL-terminated.
        let symbol = unsafe { libc::dlsym(self.0, c_name.as_ptr()) };
        if symbol.is_null() {
            return Err(AllocatorError::BackendLoadError(format!(
                "cannot resolve symbol '{}': {}",
                name,
                last_dl_error()
            )));
        }
        Ok(symbol)
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(self.0);
        }
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns either null or a NUL-terminated thread-local string.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown error".to_string()
    } else {
        // SAFETY: checked non-null above.
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveAllocation {
    size: usize,
    stream: StreamId,
}

/// Allocator backed by two foreign function pointers
#[derive(Debug)]
pub struct PluggableAllocator {
    alloc_fn: RawAllocFn,
    free_fn: RawFreeFn,
    live: Mutex<HashMap<DevicePtr, LiveAllocation>>,
    // Declared last so the library outlives any use of the function pointers.
    _library: Option<LibraryHandle>,
}

impl PluggableAllocator {
    /// Wrap function pointers that are already linked into the process
    pub fn from_fns(alloc_fn: RawAllocFn, free_fn: RawFreeFn) -> Self {
        Self {
            alloc_fn,
            free_fn,
            live: Mutex::new(HashMap::new()),
            _library: None,
        }
    }

    /// Load `alloc_name` and `free_name` from the shared object at `path`
    ///
    /// # Errors
    /// [`AllocatorError::BackendLoadError`] if the library cannot be opened
    /// or either symbol cannot be resolved.
    pub fn load(path: impl AsRef<Path>, alloc_name: &str, free_name: &str) -> AllocResult<Self> {
        let path = path.as_ref();
        let library = LibraryHandle::open(path)?;
        let alloc_symbol = library.symbol(alloc_name)?;
        let free_symbol = library.symbol(free_name)?;

        // SAFETY: the caller names symbols with the documented signatures; the
        // library stays open for as long as these pointers are reachable.
        let (alloc_fn, free_fn) = unsafe {
            (
                std::mem::transmute::<*mut c_void, RawAllocFn>(alloc_symbol),
                std::mem::transmute::<*mut c_void, RawFreeFn>(free_symbol),
            )
        };

        tracing::info!(
            "PluggableAllocator: loaded {} and {} from {}",
            alloc_name,
            free_name,
            path.display()
        );
        Ok(Self {
            alloc_fn,
            free_fn,
            live: Mutex::new(HashMap::new()),
            _library: Some(library),
        })
    }

    /// Number of live allocations made through this backend
    pub fn live_allocations(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}

impl Allocator for PluggableAllocator {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn raw_alloc(
        &self,
        size: usize,
        device: DeviceIndex,
        stream: StreamId,
    ) -> AllocResult<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::NULL);
        }
        let signed_size = isize::try_from(size).map_err(|_| {
            AllocatorError::InvalidArgument(format!("allocation size {} is too large", size))
        })?;
        let device_index = i32::try_from(device).map_err(|_| {
            AllocatorError::InvalidArgument(format!("device index {} is too large", device))
        })?;

        // SAFETY: alloc_fn follows the documented C signature.
        let raw = unsafe { (self.alloc_fn)(signed_size, device_index, stream.as_mut_ptr()) };
        if raw.is_null() {
            return Err(AllocatorError::OutOfMemory(format!(
                "pluggable allocator returned null for {} bytes on device {}",
                size, device
            )));
        }
        let ptr = DevicePtr::from_raw(raw);
        self.live.lock()?.insert(ptr, LiveAllocation { size, stream });
        Ok(ptr)
    }

    fn raw_delete(&self, ptr: DevicePtr) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let allocation = self.live.lock()?.remove(&ptr).ok_or_else(|| {
            AllocatorError::InvalidPointer(format!(
                "{} was not allocated by the pluggable allocator",
                ptr
            ))
        })?;
        // SAFETY: ptr was returned by alloc_fn with this size and stream.
        unsafe {
            (self.free_fn)(
                ptr.as_mut_ptr(),
                allocation.size,
                allocation.stream.as_mut_ptr(),
            )
        };
        Ok(())
    }

    fn record_stream(&self, _ptr: DevicePtr, _stream: StreamId) -> AllocResult<()> {
        Ok(())
    }

    fn empty_cache(&self) -> AllocResult<()> {
        Ok(())
    }

    fn set_memory_fraction(&self, _fraction: f64, _device: DeviceIndex) -> AllocResult<()> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "set_memory_fraction"))
    }

    fn memory_stats(&self, _device: DeviceIndex) -> AllocResult<DeviceStats> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "memory_stats"))
    }

    fn reset_peak_stats(&self, _device: DeviceIndex) -> AllocResult<()> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "reset_peak_stats"))
    }

    fn reset_accumulated_stats(&self, _device: DeviceIndex) -> AllocResult<()> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "reset_accumulated_stats"))
    }

    fn snapshot(&self) -> AllocResult<MemorySnapshot> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "snapshot"))
    }

    fn record_history(&self, _options: &HistoryOptions) -> AllocResult<()> {
        Err(AllocatorError::unsupported(BACKEND_NAME, "record_history"))
    }

    fn synchronize(&self) -> AllocResult<()> {
        Ok(())
    }
}
