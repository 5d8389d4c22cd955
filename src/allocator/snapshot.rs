//! Serializable view of the allocator state
//!
//! Produced under the device lock; everything here is plain data so it can
//! be handed to formatting code or written to disk.

use serde::Serialize;

use super::block::PoolKind;
use super::history::TraceAction;
use crate::backend::DeviceIndex;

/// Lifecycle state of a block at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Handed out to a caller
    ActiveAllocated,
    /// Freed by the caller, waiting on stream events
    ActivePendingFree,
    /// Cached in a pool
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockInfo {
    pub address: usize,
    pub size: usize,
    pub requested_size: usize,
    pub state: BlockState,
    pub frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub device: DeviceIndex,
    pub address: usize,
    pub total_size: usize,
    pub allocated_size: usize,
    pub active_size: usize,
    pub requested_size: usize,
    pub stream: usize,
    pub segment_type: PoolKind,
    pub allocated_at_us: u64,
    pub frames: Vec<String>,
    /// Blocks in address order
    pub blocks: Vec<BlockInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntryInfo {
    pub action: TraceAction,
    pub address: usize,
    pub size: usize,
    pub stream: usize,
    pub time_us: u64,
    pub frames: Vec<String>,
}

/// Segments of every device plus one trace list per device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub segments: Vec<SegmentInfo>,
    pub device_traces: Vec<Vec<TraceEntryInfo>>,
}

impl MemorySnapshot {
    /// Sum of segment sizes
    pub fn total_reserved(&self) -> usize {
        self.segments.iter().map(|s| s.total_size).sum()
    }

    /// Sum of allocated block sizes
    pub fn total_allocated(&self) -> usize {
        self.segments.iter().map(|s| s.allocated_size).sum()
    }

    pub fn blocks_in_state(&self, state: BlockState) -> impl Iterator<Item = &BlockInfo> {
        self.segments
            .iter()
            .flat_map(|segment| segment.blocks.iter())
            .filter(move |block| block.state == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> SegmentInfo {
        SegmentInfo {
            device: 0,
            address: 0x1000,
            total_size: 2 << 20,
            allocated_size: 512,
            active_size: 1024,
            requested_size: 100,
            stream: 0,
            segment_type: PoolKind::Small,
            allocated_at_us: 1,
            frames: Vec::new(),
            blocks: vec![
                BlockInfo {
                    address: 0x1000,
                    size: 512,
                    requested_size: 100,
                    state: BlockState::ActiveAllocated,
                    frames: Vec::new(),
                },
                BlockInfo {
                    address: 0x1200,
                    size: 512,
                    requested_size: 0,
                    state: BlockState::ActivePendingFree,
                    frames: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn test_totals() {
        let snapshot = MemorySnapshot {
            segments: vec![segment()],
            device_traces: vec![Vec::new()],
        };
        assert_eq!(snapshot.total_reserved(), 2 << 20);
        assert_eq!(snapshot.total_allocated(), 512);
        assert_eq!(snapshot.blocks_in_state(BlockState::ActivePendingFree).count(), 1);
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(segment()).unwrap();
        assert_eq!(value["segment_type"], "small");
        assert_eq!(value["blocks"][0]["state"], "active_allocated");
        assert_eq!(value["blocks"][1]["state"], "active_pending_free");
        assert_eq!(value["total_size"], 2 << 20);
    }
}
