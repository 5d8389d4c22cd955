//! Cross-stream reuse tracking
//!
//! A block freed while foreign streams may still be using it is parked
//! behind one device event per stream. It only returns to its pool after
//! every event has completed; until then it is invisible to allocation.

use std::collections::VecDeque;

use super::block::{Block, BlockId};
use crate::backend::{DeviceAllocator, DeviceEvent, DeviceIndex, DeviceResult, StreamId};

#[derive(Debug)]
struct PendingEvent {
    block: BlockId,
    stream: StreamId,
    event: Box<dyn DeviceEvent>,
}

/// Events guarding freed blocks of one device
#[derive(Debug, Default)]
pub struct StreamTracker {
    pending: VecDeque<PendingEvent>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that `stream` used `block`; the block's own stream is ignored
    pub fn record_stream(block: &mut Block, stream: StreamId) {
        if stream != block.stream {
            block.stream_uses.insert(stream);
        }
    }

    /// Whether a freed block may go back to its pool
    pub fn is_safe_to_reuse(block: &Block) -> bool {
        block.is_reusable()
    }

    /// Record an event on every stream that used `block` and park it
    ///
    /// Returns the number of events recorded; zero means the block can be
    /// reclaimed immediately. If any event cannot be recorded the block and
    /// the tracker are left untouched.
    pub fn defer(
        &mut self,
        block: &mut Block,
        backend: &dyn DeviceAllocator,
        device: DeviceIndex,
    ) -> DeviceResult<usize> {
        let mut events = Vec::with_capacity(block.stream_uses.len());
        for &stream in &block.stream_uses {
            events.push((stream, backend.record_event(device, stream)?));
        }
        block.stream_uses.clear();

        let recorded = events.len();
        block.event_count += recorded;
        self.pending
            .extend(events.into_iter().map(|(stream, event)| PendingEvent {
                block: block.id,
                stream,
                event,
            }));
        if recorded > 0 {
            tracing::trace!(
                "StreamTracker: block {} at {} waits on {} stream(s)",
                block.id,
                block.ptr,
                recorded
            );
        }
        Ok(recorded)
    }

    /// Remove completed events without blocking
    ///
    /// Returns one entry per completed event; a block appears as many times
    /// as it had events complete.
    pub fn poll(&mut self) -> DeviceResult<Vec<BlockId>> {
        let mut completed = Vec::new();
        let mut still_pending = VecDeque::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            match pending.event.query() {
                Ok(true) => completed.push(pending.block),
                Ok(false) => still_pending.push_back(pending),
                Err(err) => {
                    still_pending.push_back(pending);
                    still_pending.extend(self.pending.drain(..));
                    self.pending = still_pending;
                    return Err(err);
                }
            }
        }
        self.pending = still_pending;
        Ok(completed)
    }

    /// Block until every pending event has completed
    pub fn drain(&mut self) -> DeviceResult<Vec<BlockId>> {
        let mut completed = Vec::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.front() {
            pending.event.synchronize()?;
            tracing::trace!(
                "StreamTracker: stream {} finished with block {}",
                pending.stream,
                pending.block
            );
            completed.push(pending.block);
            self.pending.pop_front();
        }
        Ok(completed)
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::block::PoolKind;
    use crate::backend::{DevicePtr, SimulatedDevice};

    fn block(stream: usize) -> Block {
        let mut block = Block::new_segment_head(
            BlockId(1),
            0,
            StreamId(stream),
            DevicePtr(0x1000),
            512,
            PoolKind::Small,
            false,
        );
        block.allocated = true;
        block
    }

    #[test]
    fn test_own_stream_is_ignored() {
        let mut b = block(1);
        StreamTracker::record_stream(&mut b, StreamId(1));
        assert!(b.stream_uses.is_empty());
        StreamTracker::record_stream(&mut b, StreamId(2));
        StreamTracker::record_stream(&mut b, StreamId(2));
        assert_eq!(b.stream_uses.len(), 1);
    }

    #[test]
    fn test_defer_without_uses_records_nothing() {
        let device = SimulatedDevice::default();
        let mut tracker = StreamTracker::new();
        let mut b = block(1);
        b.allocated = false;
        assert_eq!(tracker.defer(&mut b, &device, 0).unwrap(), 0);
        assert!(StreamTracker::is_safe_to_reuse(&b));
    }

    #[test]
    fn test_block_waits_for_foreign_stream() {
        let device = SimulatedDevice::default();
        let mut tracker = StreamTracker::new();
        let mut b = block(1);
        StreamTracker::record_stream(&mut b, StreamId(2));
        device.submit_work(0, StreamId(2));
        b.allocated = false;

        assert_eq!(tracker.defer(&mut b, &device, 0).unwrap(), 1);
        assert!(!StreamTracker::is_safe_to_reuse(&b));
        assert!(tracker.poll().unwrap().is_empty());
        assert_eq!(tracker.pending_events(), 1);

        device.complete_work(0, StreamId(2));
        assert_eq!(tracker.poll().unwrap(), vec![BlockId(1)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_failed_record_leaves_block_untouched() {
        let device = SimulatedDevice::default();
        let mut tracker = StreamTracker::new();
        let mut b = block(1);
        StreamTracker::record_stream(&mut b, StreamId(2));
        StreamTracker::record_stream(&mut b, StreamId(3));

        assert!(tracker.defer(&mut b, &device, 99).is_err());
        assert_eq!(b.stream_uses.len(), 2);
        assert_eq!(b.event_count, 0);
        assert!(tracker.is_empty());

        assert_eq!(tracker.defer(&mut b, &device, 0).unwrap(), 2);
        assert!(b.stream_uses.is_empty());
    }

    #[test]
    fn test_drain_synchronizes() {
        let device = SimulatedDevice::default();
        let mut tracker = StreamTracker::new();
        let mut b = block(1);
        StreamTracker::record_stream(&mut b, StreamId(2));
        StreamTracker::record_stream(&mut b, StreamId(3));
        device.submit_work(0, StreamId(2));
        device.submit_work(0, StreamId(3));
        b.allocated = false;
        tracker.defer(&mut b, &device, 0).unwrap();

        let done = tracker.drain().unwrap();
        assert_eq!(done, vec![BlockId(1), BlockId(1)]);
        assert!(tracker.is_empty());
    }
}
