//! Device allocator error types

use thiserror::Error;

/// Errors reported by a [`DeviceAllocator`](super::DeviceAllocator)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("HIP initialization failed: {0}")]
    InitializationFailed(String),
    /// The device (or the process-level cap on it) cannot satisfy a reservation.
    /// This is the only variant the caching allocator answers with a cache flush.
    #[error("Device out of memory: {0}")]
    OutOfMemory(String),
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory release failed: {0}")]
    MemoryReleaseFailed(String),
    #[error("Memory query failed: {0}")]
    MemoryQueryFailed(String),
    #[error("Event operation failed: {0}")]
    EventFailed(String),
    #[error("Device {0} not found")]
    DeviceNotFound(usize),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Whether releasing cached memory and trying again can help
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory(_))
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory and transient driver failures may succeed after the
    /// cache has been flushed or outstanding work has drained. Missing
    /// devices, failed initialization and poisoned locks never will.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::OutOfMemory(_)
                | DeviceError::MemoryAllocationFailed(_)
                | DeviceError::MemoryQueryFailed(_)
                | DeviceError::EventFailed(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
