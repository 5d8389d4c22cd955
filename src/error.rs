//! Allocator error handling
//!
//! A single error type for the public allocator API, with categorization
//! for callers that need to decide between fixing their input, freeing
//! memory, or reporting a bug:
//! - User errors (bad sizes, fractions, pointers, late configuration)
//! - Resource errors (device or process memory exhausted)
//! - Backend errors (device driver or custom backend failures)
//! - Internal errors (poisoned locks)

use std::fmt;

use crate::backend::DeviceError;

/// Error type for every allocator operation
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// Malformed size, fraction, device index or configuration value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Memory exhausted after the single cache-flush retry
    ///
    /// The message carries the device and pool occupancy at failure time.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Free of an address that is not an active allocation of this allocator
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    /// Backend or configuration change after the allocator was first used
    #[error("Allocator already initialized: {0}")]
    AlreadyInitialized(String),

    /// Shared object could not be opened or a symbol could not be resolved
    #[error("Failed to load allocator backend: {0}")]
    BackendLoadError(String),

    /// The active backend does not provide this operation
    #[error("Operation not supported by the {backend} backend: {operation}")]
    Unsupported {
        backend: String,
        operation: String,
    },

    /// Device failure other than running out of memory
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Internal lock poisoned (indicates a bug)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Error categories for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller bug: never retried
    User,
    /// Memory exhausted: may succeed after the caller releases memory
    Resource,
    /// Device or backend failure
    Backend,
    /// Indicates a bug in the allocator
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl AllocatorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AllocatorError::InvalidArgument(_)
            | AllocatorError::InvalidPointer(_)
            | AllocatorError::AlreadyInitialized(_)
            | AllocatorError::Unsupported { .. } => ErrorCategory::User,

            AllocatorError::OutOfMemory(_) => ErrorCategory::Resource,

            AllocatorError::BackendLoadError(_) | AllocatorError::Device(_) => {
                ErrorCategory::Backend
            }

            AllocatorError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the same call may succeed later without changing its arguments
    pub fn is_recoverable(&self) -> bool {
        match self {
            AllocatorError::OutOfMemory(_) => true,
            AllocatorError::Device(err) => err.is_recoverable(),
            _ => false,
        }
    }

    pub(crate) fn unsupported(backend: &str, operation: &str) -> Self {
        AllocatorError::Unsupported {
            backend: backend.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for AllocatorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        AllocatorError::LockPoisoned(err.to_string())
    }
}

/// Result type for allocator operations
pub type AllocResult<T> = std::result::Result<T, AllocatorError>;
