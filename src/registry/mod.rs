//! Process-wide allocator selection
//!
//! The registry moves through three states:
//!
//! - `Unconfigured`: nothing chosen yet; the environment has not been read
//! - `Configured`: settings or a custom allocator are pending
//! - `InUse`: the first allocation built the active allocator; from here
//!   on settings and the backend are frozen and attempts to change them
//!   fail with [`AllocatorError::AlreadyInitialized`]
//!
//! The active allocator lives in a [`OnceCell`], so the hot path reads it
//! without taking the configuration lock.

pub mod pluggable;

pub use pluggable::{PluggableAllocator, RawAllocFn, RawFreeFn};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};

use crate::allocator::{validate_fraction, Allocator, AllocatorConfig, HistoryOptions, NativeCachingAllocator};
use crate::backend::{default_device_allocator, DeviceAllocator, DeviceIndex};
use crate::error::{AllocResult, AllocatorError};

/// Lifecycle of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Unconfigured,
    Configured,
    InUse,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitState::Unconfigured => write!(f, "unconfigured"),
            InitState::Configured => write!(f, "configured"),
            InitState::InUse => write!(f, "in use"),
        }
    }
}

#[derive(Debug)]
struct PendingState {
    state: InitState,
    config: AllocatorConfig,
    custom: Option<Arc<dyn Allocator>>,
    fractions: BTreeMap<DeviceIndex, f64>,
    history: Option<HistoryOptions>,
}

/// Holder of the active allocator and its pending configuration
#[derive(Debug)]
pub struct AllocatorRegistry {
    device: Arc<dyn DeviceAllocator>,
    pending: Mutex<PendingState>,
    active: OnceCell<Arc<dyn Allocator>>,
}

static GLOBAL: Lazy<AllocatorRegistry> =
    Lazy::new(|| AllocatorRegistry::new(default_device_allocator()));

/// The process-wide registry
pub fn global() -> &'static AllocatorRegistry {
    &GLOBAL
}

impl AllocatorRegistry {
    /// Registry over `device`; the environment is read on first use
    pub fn new(device: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            device,
            pending: Mutex::new(PendingState {
                state: InitState::Unconfigured,
                config: AllocatorConfig::default(),
                custom: None,
                fractions: BTreeMap::new(),
                history: None,
            }),
            active: OnceCell::new(),
        }
    }

    /// Device collaborator used by the native allocator
    pub fn device(&self) -> &Arc<dyn DeviceAllocator> {
        &self.device
    }

    pub fn state(&self) -> AllocResult<InitState> {
        if self.active.get().is_some() {
            return Ok(InitState::InUse);
        }
        Ok(self.pending.lock()?.state)
    }

    /// Read `ROCMCACHE_ALLOC_CONF` if that has not happened yet
    ///
    /// Malformed settings fail here rather than at the first allocation.
    pub fn init(&self) -> AllocResult<()> {
        if self.active.get().is_some() {
            return Ok(());
        }
        let mut pending = self.pending.lock()?;
        Self::load_env(&mut pending)
    }

    fn load_env(pending: &mut PendingState) -> AllocResult<()> {
        if pending.state != InitState::Unconfigured {
            return Ok(());
        }
        pending.config = AllocatorConfig::from_env()?;
        pending.state = InitState::Configured;
        tracing::debug!("AllocatorRegistry: configuration {:?}", pending.config);
        Ok(())
    }

    /// Fail once the allocator has been built
    ///
    /// Checks the pending state under its lock, so a concurrent first
    /// allocation cannot slip in between the check and the change.
    fn ensure_not_in_use(pending: &PendingState, what: &str) -> AllocResult<()> {
        if pending.state == InitState::InUse {
            return Err(AllocatorError::AlreadyInitialized(format!(
                "cannot {} after the allocator has been used",
                what
            )));
        }
        Ok(())
    }

    /// Apply a configuration string on top of the environment settings
    pub fn set_allocator_settings(&self, settings: &str) -> AllocResult<()> {
        let mut pending = self.pending.lock()?;
        Self::ensure_not_in_use(&pending, "change allocator settings")?;
        Self::load_env(&mut pending)?;
        let mut config = pending.config.clone();
        config.apply_settings(settings)?;
        pending.config = config;
        Ok(())
    }

    /// Replace the pending configuration wholesale
    pub fn configure(&self, config: AllocatorConfig) -> AllocResult<()> {
        config.validate()?;
        let mut pending = self.pending.lock()?;
        Self::ensure_not_in_use(&pending, "change allocator settings")?;
        pending.config = config;
        pending.state = InitState::Configured;
        Ok(())
    }

    /// Install a custom allocator to be used instead of the native one
    pub fn change_current_allocator(&self, allocator: Arc<dyn Allocator>) -> AllocResult<()> {
        let mut pending = self.pending.lock()?;
        Self::ensure_not_in_use(&pending, "change the allocator backend")?;
        Self::load_env(&mut pending)?;
        tracing::info!("AllocatorRegistry: backend set to '{}'", allocator.name());
        pending.custom = Some(allocator);
        Ok(())
    }

    /// Allocator already in use, if any
    pub fn current(&self) -> Option<&Arc<dyn Allocator>> {
        self.active.get()
    }

    /// The active allocator, building it on first call (locks configuration in)
    pub fn active(&self) -> AllocResult<&Arc<dyn Allocator>> {
        self.active.get_or_try_init(|| {
            let mut pending = self.pending.lock()?;
            Self::load_env(&mut pending)?;

            let allocator: Arc<dyn Allocator> = match &pending.custom {
                Some(custom) => Arc::clone(custom),
                None => {
                    let native =
                        NativeCachingAllocator::new(Arc::clone(&self.device), pending.config.clone())?;
                    for (&device, &fraction) in &pending.fractions {
                        native.set_memory_fraction(fraction, device)?;
                    }
                    if let Some(options) = &pending.history {
                        native.record_history(options)?;
                    }
                    Arc::new(native)
                }
            };
            pending.state = InitState::InUse;
            tracing::info!("AllocatorRegistry: '{}' allocator in use", allocator.name());
            Ok(allocator)
        })
    }

    /// Name of the backend that is or will be active
    pub fn backend_name(&self) -> AllocResult<String> {
        if let Some(active) = self.active.get() {
            return Ok(active.name().to_string());
        }
        let mut pending = self.pending.lock()?;
        Self::load_env(&mut pending)?;
        Ok(match &pending.custom {
            Some(custom) => custom.name().to_string(),
            None => pending.config.backend.to_string(),
        })
    }

    /// Set a memory fraction now, or remember it for when the allocator is built
    pub fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> AllocResult<()> {
        validate_fraction(fraction)?;
        if device >= self.device.device_count() {
            return Err(AllocatorError::InvalidArgument(format!(
                "device index {} out of range, {} device(s) available",
                device,
                self.device.device_count()
            )));
        }
        if let Some(active) = self.active.get() {
            return active.set_memory_fraction(fraction, device);
        }
        let mut pending = self.pending.lock()?;
        if pending.state == InitState::InUse {
            drop(pending);
            return self.active()?.set_memory_fraction(fraction, device);
        }
        if let Some(custom) = &pending.custom {
            return custom.set_memory_fraction(fraction, device);
        }
        pending.fractions.insert(device, fraction);
        Ok(())
    }

    /// Configure history now, or remember it for when the allocator is built
    pub fn record_history(&self, options: HistoryOptions) -> AllocResult<()> {
        options.validate()?;
        if let Some(active) = self.active.get() {
            return active.record_history(&options);
        }
        let mut pending = self.pending.lock()?;
        if pending.state == InitState::InUse {
            drop(pending);
            return self.active()?.record_history(&options);
        }
        if let Some(custom) = &pending.custom {
            return custom.record_history(&options);
        }
        pending.history = Some(options);
        Ok(())
    }
}
