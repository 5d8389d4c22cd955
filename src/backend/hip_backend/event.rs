//! HIP event wrapper used to fence deferred frees

use std::ptr;

use super::ffi;
use crate::backend::device::{DeviceEvent, StreamId};
use crate::backend::error::{DeviceError, DeviceResult};

// SAFETY: HipEvent is Send because it only contains a raw event handle that
// the HIP runtime allows to be queried from any host thread.
// NOTE: HipEvent does NOT implement Clone because cloning raw pointers
// would cause double-destroy when both instances are dropped.
unsafe impl Send for HipEvent {}

/// Synchronization-only HIP event (timing disabled)
#[derive(Debug)]
pub struct HipEvent {
    event: *mut std::ffi::c_void,
}

impl HipEvent {
    /// Create an event and record it on `stream`
    pub fn record_on(stream: StreamId) -> DeviceResult<Self> {
        let mut event: *mut std::ffi::c_void = ptr::null_mut();

        let result =
            unsafe { ffi::hipEventCreateWithFlags(&mut event, ffi::HIP_EVENT_DISABLE_TIMING) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventCreateWithFlags failed with code {}",
                result
            )));
        }
        if event.is_null() {
            return Err(DeviceError::EventFailed(
                "hipEventCreateWithFlags returned null pointer".to_string(),
            ));
        }

        // Constructed before recording so Drop destroys it on failure.
        let event = HipEvent { event };
        let result = unsafe { ffi::hipEventRecord(event.event, stream.as_mut_ptr()) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::EventFailed(format!(
                "hipEventRecord on stream {} failed with code {}",
                stream, result
            )));
        }

        tracing::trace!("HipEvent: recorded {:?} on stream {}", event.event, stream);
        Ok(event)
    }
}

impl DeviceEvent for HipEvent {
    fn query(&self) -> DeviceResult<bool> {
        let result = unsafe { ffi::hipEventQuery(self.event) };
        match result {
            ffi::HIP_SUCCESS => Ok(true),
            ffi::HIP_ERROR_NOT_READY => {
                // hipEventQuery leaves hipErrorNotReady as the sticky last
                // error; clear it so unrelated callers don't observe it.
                unsafe { ffi::hipGetLastError() };
                Ok(false)
            }
            code => Err(DeviceError::EventFailed(format!(
                "hipEventQuery failed with code {}",
                code
            ))),
        }
    }

    fn synchronize(&self) -> DeviceResult<()> {
        let result = unsafe { ffi::hipEventSynchronize(self.event) };
        if result != ffi::HIP_SUCCESS {
            Err(DeviceError::EventFailed(format!(
                "hipEventSynchronize failed with code {}",
                result
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for HipEvent {
    fn drop(&mut self) {
        if !self.event.is_null() {
            unsafe {
                ffi::hipEventDestroy(self.event);
            }
        }
    }
}
