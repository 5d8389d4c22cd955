//! ROCm/HIP device allocator
//!
//! Real device memory through the HIP runtime. Only compiled with the
//! `rocm` feature, which also links `libamdhip64`.

mod allocator;
mod event;
mod ffi;

pub use allocator::HipDeviceAllocator;
pub use event::HipEvent;
