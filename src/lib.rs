//! rocmcache - stream-aware caching allocator for AMD GPU memory
//!
//! Device reservations through the HIP runtime are slow and synchronizing,
//! so freed blocks are kept in per-device pools and handed out again to
//! later requests on the same stream. Blocks used by other streams are only
//! recycled once that work has completed.
//!
//! Entry points:
//! - [`memory`]: process-wide allocation, statistics and configuration
//! - [`summary`]: text reports and snapshot files
//! - [`registry::AllocatorRegistry`]: a private allocator instance, e.g.
//!   over a [`backend::SimulatedDevice`]

#![allow(clippy::too_many_arguments)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::collapsible_else_if)]
#![allow(clippy::type_complexity)]

pub mod allocator;
pub mod backend;
pub mod error;
pub mod logging;
pub mod memory;
pub mod registry;
pub mod summary;

pub use allocator::{
    Allocator, AllocatorConfig, DeviceStats, HistoryOptions, MemorySnapshot,
    NativeCachingAllocator,
};
pub use backend::{DeviceAllocator, DeviceIndex, DevicePtr, SimulatedDevice, StreamId};
pub use error::{AllocResult, AllocatorError, ErrorCategory};
pub use logging::{init_logging_default, init_logging_from_env, init_with_config, LoggingConfig};
pub use registry::{AllocatorRegistry, InitState, PluggableAllocator};
pub use summary::{dump_snapshot, memory_summary, SummaryError};
