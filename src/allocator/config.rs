//! Caching allocator configuration
//!
//! [`AllocatorConfig`] holds the process-wide tuning knobs. It is built from
//! defaults, builder setters, or the `ROCMCACHE_ALLOC_CONF` string
//! (`key:value` pairs separated by commas):
//!
//! | key                            | value                                   |
//! |--------------------------------|-----------------------------------------|
//! | `max_split_size_mb`            | integer MiB, must exceed 20             |
//! | `roundup_power2_divisions`     | 0 (off) or a power of two               |
//! | `garbage_collection_threshold` | fraction strictly between 0 and 1       |
//! | `backend`                      | `native`                                |
//!
//! Any other key is rejected.

use std::fmt;

use serde::Serialize;

use crate::error::{AllocResult, AllocatorError};

/// Environment variable read once at initialization
pub const ALLOC_CONF_ENV: &str = "ROCMCACHE_ALLOC_CONF";

/// All block sizes are multiples of this
pub const MIN_BLOCK_SIZE: usize = 512;
/// Default boundary between the small and large pools
pub const SMALL_SIZE: usize = 1 << 20;
/// Segment size reserved for small requests
pub const SMALL_BUFFER: usize = 2 << 20;
/// Segment size reserved for mid-sized large requests
pub const LARGE_BUFFER: usize = 20 << 20;
/// Large requests at or above this get a segment of their own size
pub const MIN_LARGE_ALLOC: usize = 10 << 20;
/// Rounding granularity of dedicated large segments
pub const ROUND_LARGE: usize = 2 << 20;

const MIB: usize = 1 << 20;

/// Which allocator implementation serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The built-in caching allocator
    #[default]
    Native,
    /// A custom allocator loaded from a shared object
    Pluggable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Pluggable => write!(f, "pluggable"),
        }
    }
}

/// Process-wide caching allocator settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatorConfig {
    /// Requests strictly below this size use the small pool
    pub small_size_threshold: usize,
    /// Blocks at or above this size are never split ("oversize")
    pub max_split_size: usize,
    /// Power-of-two rounding divisions (0 disables)
    pub roundup_power2_divisions: usize,
    /// Fraction of the allowed memory above which cached blocks are reclaimed (0 disables)
    pub garbage_collection_threshold: f64,
    /// Selected backend
    pub backend: BackendKind,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            small_size_threshold: SMALL_SIZE,
            max_split_size: usize::MAX,
            roundup_power2_divisions: 0,
            garbage_collection_threshold: 0.0,
            backend: BackendKind::Native,
        }
    }
}

impl AllocatorConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by a configuration string
    pub fn parse(settings: &str) -> AllocResult<Self> {
        let mut config = Self::default();
        config.apply_settings(settings)?;
        Ok(config)
    }

    /// Defaults overridden by `ROCMCACHE_ALLOC_CONF`, if set
    pub fn from_env() -> AllocResult<Self> {
        match std::env::var(ALLOC_CONF_ENV) {
            Ok(settings) => Self::parse(&settings),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Set the small/large pool boundary
    pub fn with_small_size_threshold(mut self, bytes: usize) -> Self {
        self.small_size_threshold = bytes;
        self
    }

    /// Set the oversize threshold in bytes
    pub fn with_max_split_size(mut self, bytes: usize) -> Self {
        self.max_split_size = bytes;
        self
    }

    /// Set power-of-two rounding divisions
    pub fn with_roundup_power2_divisions(mut self, divisions: usize) -> Self {
        self.roundup_power2_divisions = divisions;
        self
    }

    /// Set the garbage collection threshold
    pub fn with_garbage_collection_threshold(mut self, threshold: f64) -> Self {
        self.garbage_collection_threshold = threshold;
        self
    }

    /// Set the backend kind
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Apply a configuration string on top of the current values
    ///
    /// Values are validated as they are parsed; on error `self` may be
    /// partially updated and should be discarded.
    pub fn apply_settings(&mut self, settings: &str) -> AllocResult<()> {
        for option in settings.split(',') {
            let option = option.trim();
            if option.is_empty() {
                continue;
            }
            let (key, value) = option.split_once(':').ok_or_else(|| {
                AllocatorError::InvalidArgument(format!(
                    "malformed allocator option '{}', expected key:value",
                    option
                ))
            })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "max_split_size_mb" => {
                    let mb = parse_integer(key, value)?;
                    if mb <= LARGE_BUFFER / MIB {
                        return Err(AllocatorError::InvalidArgument(format!(
                            "max_split_size_mb too small, must be > {}",
                            LARGE_BUFFER / MIB
                        )));
                    }
                    self.max_split_size = mb.checked_mul(MIB).ok_or_else(|| {
                        AllocatorError::InvalidArgument(format!(
                            "max_split_size_mb {} overflows",
                            mb
                        ))
                    })?;
                }
                "roundup_power2_divisions" => {
                    self.roundup_power2_divisions = parse_integer(key, value)?;
                }
                "garbage_collection_threshold" => {
                    self.garbage_collection_threshold = value.parse::<f64>().map_err(|_| {
                        AllocatorError::InvalidArgument(format!(
                            "garbage_collection_threshold expects a number, got '{}'",
                            value
                        ))
                    })?;
                    if !(self.garbage_collection_threshold > 0.0
                        && self.garbage_collection_threshold < 1.0)
                    {
                        return Err(AllocatorError::InvalidArgument(format!(
                            "garbage_collection_threshold must be in (0, 1), got {}",
                            value
                        )));
                    }
                }
                "backend" => {
                    self.backend = match value {
                        "native" => BackendKind::Native,
                        other => {
                            return Err(AllocatorError::InvalidArgument(format!(
                                "unknown allocator backend '{}' (custom backends are installed with change_current_allocator)",
                                other
                            )))
                        }
                    };
                }
                other => {
                    return Err(AllocatorError::InvalidArgument(format!(
                        "unrecognized allocator option '{}'",
                        other
                    )))
                }
            }
        }
        self.validate()
    }

    /// Check invariants between fields
    pub fn validate(&self) -> AllocResult<()> {
        if self.small_size_threshold < MIN_BLOCK_SIZE || self.small_size_threshold > SMALL_BUFFER {
            return Err(AllocatorError::InvalidArgument(format!(
                "small_size_threshold must be within [{}, {}], got {}",
                MIN_BLOCK_SIZE, SMALL_BUFFER, self.small_size_threshold
            )));
        }
        if self.max_split_size != usize::MAX && self.max_split_size <= LARGE_BUFFER {
            return Err(AllocatorError::InvalidArgument(format!(
                "max_split_size must exceed {} bytes, got {}",
                LARGE_BUFFER, self.max_split_size
            )));
        }
        if self.roundup_power2_divisions != 0 && !self.roundup_power2_divisions.is_power_of_two() {
            return Err(AllocatorError::InvalidArgument(format!(
                "roundup_power2_divisions must be a power of 2, got {}",
                self.roundup_power2_divisions
            )));
        }
        if !(0.0..1.0).contains(&self.garbage_collection_threshold) {
            return Err(AllocatorError::InvalidArgument(format!(
                "garbage_collection_threshold must be in [0, 1), got {}",
                self.garbage_collection_threshold
            )));
        }
        Ok(())
    }

    /// Whether `size` goes to the small pool
    pub fn is_small(&self, size: usize) -> bool {
        size < self.small_size_threshold
    }

    /// Whether a block of `size` bytes is oversize (never split)
    pub fn is_oversize(&self, size: usize) -> bool {
        size >= self.max_split_size
    }

    /// Round a request to the size actually carved from a segment
    ///
    /// `None` when the rounded size does not fit in `usize`.
    pub fn round_size(&self, size: usize) -> Option<usize> {
        if size < MIN_BLOCK_SIZE {
            return Some(MIN_BLOCK_SIZE);
        }
        let divisions = self.roundup_power2_divisions;
        if divisions > 0 && size > MIN_BLOCK_SIZE.saturating_mul(divisions) {
            roundup_power2_next_division(size, divisions)
        } else {
            size.div_ceil(MIN_BLOCK_SIZE).checked_mul(MIN_BLOCK_SIZE)
        }
    }

    /// Size of the segment reserved to serve a rounded request
    ///
    /// `small` is the pool chosen for the unrounded request.
    pub fn segment_size(&self, rounded: usize, small: bool) -> Option<usize> {
        if self.is_oversize(rounded) {
            Some(rounded)
        } else if small {
            Some(SMALL_BUFFER)
        } else if rounded < MIN_LARGE_ALLOC {
            Some(LARGE_BUFFER)
        } else {
            rounded.div_ceil(ROUND_LARGE).checked_mul(ROUND_LARGE)
        }
    }
}

fn parse_integer(key: &str, value: &str) -> AllocResult<usize> {
    value.parse::<usize>().map_err(|_| {
        AllocatorError::InvalidArgument(format!(
            "{} expects a non-negative integer, got '{}'",
            key, value
        ))
    })
}

/// Round `size` up to the next of `divisions` equal steps between the
/// surrounding powers of two
///
/// With 4 divisions, 1200 (between 1024 and 2048) rounds to 1280.
fn roundup_power2_next_division(size: usize, divisions: usize) -> Option<usize> {
    if size.is_power_of_two() {
        return Some(size);
    }
    if divisions < 2 {
        return size.checked_next_power_of_two();
    }
    let power2_floor = 1usize << (usize::BITS - 1 - size.leading_zeros());
    let step = power2_floor >> divisions.trailing_zeros();
    if step == 0 {
        return power2_floor.checked_mul(2);
    }
    let floor = size & !(step - 1);
    if floor == size {
        Some(size)
    } else {
        floor.checked_add(step)
    }
}
