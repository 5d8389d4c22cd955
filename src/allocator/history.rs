//! Allocation history recording
//!
//! When enabled, the allocator keeps a bounded ring buffer of
//! [`TraceEntry`]s (oldest evicted first) and may capture a backtrace for
//! every live block and trace entry. Recording is configured through
//! [`HistoryOptions`]:
//!
//! - `enabled`: `None` (off), `"state"` (block call sites only) or `"all"`
//!   (call sites plus the trace ring)
//! - `context`: `None`, `"state"` (live blocks), `"alloc"` (also alloc
//!   trace entries) or `"all"` (every trace entry)
//! - `max_entries`: ring capacity

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::backend::{DeviceIndex, DevicePtr, StreamId};
use crate::error::{AllocResult, AllocatorError};

/// What gets recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RecordScope {
    #[default]
    Off,
    /// Call sites of live blocks only
    State,
    /// Call sites and the trace ring
    All,
}

/// Where backtraces are captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ContextScope {
    #[default]
    Off,
    State,
    Alloc,
    All,
}

/// History recording options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryOptions {
    pub record: RecordScope,
    pub context: ContextScope,
    pub max_entries: usize,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            record: RecordScope::Off,
            context: ContextScope::Off,
            max_entries: usize::MAX,
        }
    }
}

impl HistoryOptions {
    /// Recording disabled
    pub fn off() -> Self {
        Self::default()
    }

    /// Full recording with backtraces everywhere
    pub fn all(max_entries: usize) -> Self {
        Self {
            record: RecordScope::All,
            context: ContextScope::All,
            max_entries,
        }
    }

    /// Build from the string form
    ///
    /// `enabled` is `None`, `"state"` or `"all"`; `context` is `None`,
    /// `"state"`, `"alloc"` or `"all"`. Context requires recording to be on.
    pub fn parse(
        enabled: Option<&str>,
        context: Option<&str>,
        max_entries: usize,
    ) -> AllocResult<Self> {
        let record = match enabled {
            None => RecordScope::Off,
            Some("state") => RecordScope::State,
            Some("all") => RecordScope::All,
            Some(other) => {
                return Err(AllocatorError::InvalidArgument(format!(
                    "history 'enabled' must be None, \"state\" or \"all\", got \"{}\"",
                    other
                )))
            }
        };
        let context = match context {
            None => ContextScope::Off,
            Some("state") => ContextScope::State,
            Some("alloc") => ContextScope::Alloc,
            Some("all") => ContextScope::All,
            Some(other) => {
                return Err(AllocatorError::InvalidArgument(format!(
                    "history 'context' must be None, \"state\", \"alloc\" or \"all\", got \"{}\"",
                    other
                )))
            }
        };
        let options = Self {
            record,
            context,
            max_entries,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> AllocResult<()> {
        if self.max_entries == 0 {
            return Err(AllocatorError::InvalidArgument(
                "history max_entries must be at least 1".to_string(),
            ));
        }
        if self.record == RecordScope::Off && self.context != ContextScope::Off {
            return Err(AllocatorError::InvalidArgument(
                "history context requires recording to be enabled".to_string(),
            ));
        }
        if self.record == RecordScope::State && self.context > ContextScope::State {
            return Err(AllocatorError::InvalidArgument(
                "trace context requires enabled=\"all\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Kind of recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    /// A block was handed out
    Alloc,
    /// The caller released a block
    FreeRequested,
    /// The block went back to its pool
    FreeCompleted,
    /// A segment was reserved from the device
    SegmentAlloc,
    /// A segment was returned to the device
    SegmentFree,
    /// An allocation failed for good
    Oom,
}

/// One history ring entry
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub action: TraceAction,
    pub device: DeviceIndex,
    pub address: DevicePtr,
    pub size: usize,
    pub stream: StreamId,
    /// Microseconds since the Unix epoch
    pub time_us: u64,
    pub frames: Option<Arc<Backtrace>>,
}

/// Microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Render a captured backtrace as one string per line
pub fn frames_of(backtrace: &Option<Arc<Backtrace>>) -> Vec<String> {
    backtrace
        .as_ref()
        .map(|bt| bt.to_string().lines().map(|line| line.trim().to_string()).collect())
        .unwrap_or_default()
}

/// Per-device history state
#[derive(Debug, Default)]
pub struct HistoryRecorder {
    options: HistoryOptions,
    entries: VecDeque<TraceEntry>,
}

impl HistoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(&self) -> &HistoryOptions {
        &self.options
    }

    /// Replace the options; turning recording off clears the ring
    pub fn configure(&mut self, options: HistoryOptions) {
        if options.record != RecordScope::All {
            self.entries.clear();
        }
        while self.entries.len() > options.max_entries {
            self.entries.pop_front();
        }
        self.options = options;
    }

    pub fn is_enabled(&self) -> bool {
        self.options.record != RecordScope::Off
    }

    /// Call site to attach to a newly allocated block, if wanted
    pub fn block_context(&self) -> Option<Arc<Backtrace>> {
        if self.is_enabled() && self.options.context != ContextScope::Off {
            Some(Arc::new(Backtrace::force_capture()))
        } else {
            None
        }
    }

    fn wants_frames(&self, action: TraceAction) -> bool {
        match self.options.context {
            ContextScope::Off | ContextScope::State => false,
            ContextScope::Alloc => matches!(action, TraceAction::Alloc | TraceAction::SegmentAlloc),
            ContextScope::All => true,
        }
    }

    /// Append a trace entry when the ring is enabled
    ///
    /// `context` is reused as the entry's frames when frames are wanted,
    /// otherwise a fresh backtrace is captured.
    pub fn record(
        &mut self,
        action: TraceAction,
        device: DeviceIndex,
        address: DevicePtr,
        size: usize,
        stream: StreamId,
        context: Option<&Arc<Backtrace>>,
    ) {
        if self.options.record != RecordScope::All {
            return;
        }
        let frames = if self.wants_frames(action) {
            context
                .cloned()
                .or_else(|| Some(Arc::new(Backtrace::force_capture())))
        } else {
            None
        };
        if self.entries.len() >= self.options.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            action,
            device,
            address,
            size,
            stream,
            time_us: now_us(),
            frames,
        });
    }

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
