//! Device memory backends
//!
//! The [`DeviceAllocator`] trait is the only way the caching allocator
//! reaches device memory. Two implementations ship with the crate:
//! [`HipDeviceAllocator`] (feature `rocm`) and [`SimulatedDevice`].

pub mod device;
pub mod error;
#[cfg(feature = "rocm")]
pub mod hip_backend;
pub mod simulated;

pub use device::{DeviceAllocator, DeviceEvent, DeviceIndex, DevicePtr, StreamId};
pub use error::{DeviceError, DeviceResult};
#[cfg(feature = "rocm")]
pub use hip_backend::{HipDeviceAllocator, HipEvent};
pub use simulated::{SimulatedDevice, SimulatedEvent};

use std::sync::Arc;

/// Device allocator used by the process-wide registry
///
/// With the `rocm` feature this is the HIP runtime; if HIP fails to
/// initialize, or without the feature, a single simulated 8 GiB device is
/// used instead.
pub fn default_device_allocator() -> Arc<dyn DeviceAllocator> {
    #[cfg(feature = "rocm")]
    {
        match HipDeviceAllocator::new() {
            Ok(hip) => return Arc::new(hip),
            Err(err) => {
                tracing::warn!("HIP unavailable ({}), falling back to simulated device", err);
            }
        }
    }
    Arc::new(SimulatedDevice::default())
}
