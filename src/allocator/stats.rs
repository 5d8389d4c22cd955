//! Allocator statistics
//!
//! Every metric is tracked as a [`Stat`] per partition (`all`,
//! `small_pool`, `large_pool`). Blocks and segments that belong to an
//! oversize reservation are counted in `all` and in the two oversize
//! buckets, never in the pool partitions.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::block::PoolKind;

/// One counter bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub current: i64,
    pub peak: i64,
    pub allocated: i64,
    pub freed: i64,
}

impl Stat {
    pub fn increase(&mut self, amount: i64) {
        self.current += amount;
        self.peak = self.peak.max(self.current);
        self.allocated += amount;
    }

    pub fn decrease(&mut self, amount: i64) {
        self.current -= amount;
        debug_assert!(self.current >= 0, "stat went negative: {:?}", self);
        self.freed += amount;
    }

    pub fn reset_accumulated(&mut self) {
        self.allocated = 0;
        self.freed = 0;
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.current;
    }

    /// `[current, peak, allocated, freed]`
    pub fn fields(&self) -> [i64; 4] {
        [self.current, self.peak, self.allocated, self.freed]
    }

    fn to_value(self) -> Value {
        json!({
            "current": self.current,
            "peak": self.peak,
            "allocated": self.allocated,
            "freed": self.freed,
        })
    }
}

/// Partition of a [`StatArray`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Aggregate = 0,
    SmallPool = 1,
    LargePool = 2,
}

impl StatType {
    pub const ALL: [StatType; 3] = [StatType::Aggregate, StatType::SmallPool, StatType::LargePool];

    pub fn key(&self) -> &'static str {
        match self {
            StatType::Aggregate => "all",
            StatType::SmallPool => "small_pool",
            StatType::LargePool => "large_pool",
        }
    }
}

pub type StatArray = [Stat; 3];

/// Which partitions of a [`StatArray`] an update touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatTypes([bool; 3]);

impl StatTypes {
    /// Aggregate plus the pool's partition, or aggregate only for oversize
    pub fn for_block(pool: PoolKind, oversize: bool) -> Self {
        let mut selected = [true, false, false];
        if !oversize {
            match pool {
                PoolKind::Small => selected[StatType::SmallPool as usize] = true,
                PoolKind::Large => selected[StatType::LargePool as usize] = true,
            }
        }
        StatTypes(selected)
    }

    pub fn contains(&self, stat_type: StatType) -> bool {
        self.0[stat_type as usize]
    }
}

fn increase(array: &mut StatArray, types: StatTypes, amount: i64) {
    for stat_type in StatType::ALL {
        if types.contains(stat_type) {
            array[stat_type as usize].increase(amount);
        }
    }
}

fn decrease(array: &mut StatArray, types: StatTypes, amount: i64) {
    for stat_type in StatType::ALL {
        if types.contains(stat_type) {
            array[stat_type as usize].decrease(amount);
        }
    }
}

/// All statistics of one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Number of live allocation requests
    pub allocated: StatArray,
    pub allocated_bytes: StatArray,
    pub segment: StatArray,
    pub reserved_bytes: StatArray,
    /// Allocated plus pending-free blocks
    pub active: StatArray,
    pub active_bytes: StatArray,
    /// Free blocks inside partially used segments (cannot be released)
    pub inactive_split: StatArray,
    pub inactive_split_bytes: StatArray,
    /// Unrounded request sizes
    pub requested_bytes: StatArray,
    pub oversize_allocations: Stat,
    pub oversize_segments: Stat,
    pub num_alloc_retries: i64,
    pub num_ooms: i64,
    /// Configured oversize threshold, -1 when unlimited
    pub max_split_size: i64,
}

impl DeviceStats {
    pub fn new(max_split_size: usize) -> Self {
        Self {
            max_split_size: i64::try_from(max_split_size).unwrap_or(-1),
            ..Default::default()
        }
    }

    fn arrays_mut(&mut self) -> [&mut StatArray; 9] {
        [
            &mut self.allocated,
            &mut self.allocated_bytes,
            &mut self.segment,
            &mut self.reserved_bytes,
            &mut self.active,
            &mut self.active_bytes,
            &mut self.inactive_split,
            &mut self.inactive_split_bytes,
            &mut self.requested_bytes,
        ]
    }

    pub(crate) fn segment_reserved(&mut self, types: StatTypes, oversize: bool, size: usize) {
        increase(&mut self.segment, types, 1);
        increase(&mut self.reserved_bytes, types, size as i64);
        if oversize {
            self.oversize_segments.increase(1);
        }
    }

    pub(crate) fn segment_released(&mut self, types: StatTypes, oversize: bool, size: usize) {
        decrease(&mut self.segment, types, 1);
        decrease(&mut self.reserved_bytes, types, size as i64);
        if oversize {
            self.oversize_segments.decrease(1);
        }
    }

    pub(crate) fn block_allocated(
        &mut self,
        types: StatTypes,
        oversize: bool,
        size: usize,
        requested: usize,
    ) {
        increase(&mut self.allocated, types, 1);
        increase(&mut self.allocated_bytes, types, size as i64);
        increase(&mut self.active, types, 1);
        increase(&mut self.active_bytes, types, size as i64);
        increase(&mut self.requested_bytes, types, requested as i64);
        if oversize {
            self.oversize_allocations.increase(1);
        }
    }

    /// The caller gave the block back; it stays active until reclaimed
    pub(crate) fn block_freed(&mut self, types: StatTypes, oversize: bool, size: usize) {
        decrease(&mut self.allocated, types, 1);
        decrease(&mut self.allocated_bytes, types, size as i64);
        if oversize {
            self.oversize_allocations.decrease(1);
        }
    }

    /// The block went back to its pool
    pub(crate) fn block_reclaimed(&mut self, types: StatTypes, size: usize, requested: usize) {
        decrease(&mut self.active, types, 1);
        decrease(&mut self.active_bytes, types, size as i64);
        decrease(&mut self.requested_bytes, types, requested as i64);
    }

    /// Adjust the inactive split counters by a signed delta
    pub(crate) fn inactive_split_changed(&mut self, types: StatTypes, blocks: i64, bytes: i64) {
        for (array, delta) in [
            (&mut self.inactive_split, blocks),
            (&mut self.inactive_split_bytes, bytes),
        ] {
            if delta > 0 {
                increase(array, types, delta);
            } else if delta < 0 {
                decrease(array, types, -delta);
            }
        }
    }

    /// Set every peak to its current value
    pub fn reset_peak(&mut self) {
        for array in self.arrays_mut() {
            array.iter_mut().for_each(Stat::reset_peak);
        }
        self.oversize_allocations.reset_peak();
        self.oversize_segments.reset_peak();
    }

    /// Zero the cumulative counters and the retry/OOM event counts
    pub fn reset_accumulated(&mut self) {
        for array in self.arrays_mut() {
            array.iter_mut().for_each(Stat::reset_accumulated);
        }
        self.oversize_allocations.reset_accumulated();
        self.oversize_segments.reset_accumulated();
        self.num_alloc_retries = 0;
        self.num_ooms = 0;
    }

    /// Nested mapping `metric -> partition -> field -> value`
    pub fn to_nested(&self) -> Value {
        let mut root = Map::new();
        let arrays: [(&str, &StatArray); 9] = [
            ("allocated", &self.allocated),
            ("allocated_bytes", &self.allocated_bytes),
            ("segment", &self.segment),
            ("reserved_bytes", &self.reserved_bytes),
            ("active", &self.active),
            ("active_bytes", &self.active_bytes),
            ("inactive_split", &self.inactive_split),
            ("inactive_split_bytes", &self.inactive_split_bytes),
            ("requested_bytes", &self.requested_bytes),
        ];
        for (name, array) in arrays {
            let mut partitions = Map::new();
            for stat_type in StatType::ALL {
                partitions.insert(
                    stat_type.key().to_string(),
                    array[stat_type as usize].to_value(),
                );
            }
            root.insert(name.to_string(), Value::Object(partitions));
        }
        root.insert(
            "oversize_allocations".to_string(),
            self.oversize_allocations.to_value(),
        );
        root.insert(
            "oversize_segments".to_string(),
            self.oversize_segments.to_value(),
        );
        root.insert("num_alloc_retries".to_string(), json!(self.num_alloc_retries));
        root.insert("num_ooms".to_string(), json!(self.num_ooms));
        root.insert("max_split_size".to_string(), json!(self.max_split_size));
        Value::Object(root)
    }

    /// Flattened `metric.partition.field` keys in lexicographic order
    pub fn to_flat(&self) -> BTreeMap<String, i64> {
        flatten(&self.to_nested())
    }
}

/// Flatten a nested mapping depth-first into dot-qualified keys
///
/// Non-integer leaves are skipped.
pub fn flatten(value: &Value) -> BTreeMap<String, i64> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, i64>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&path, child, out);
                }
            }
            Value::Number(number) => {
                if let Some(n) = number.as_i64() {
                    out.insert(prefix.to_string(), n);
                }
            }
            _ => {}
        }
    }

    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

/// Human-readable byte count
pub fn format_size(bytes: i64) -> String {
    let magnitude = bytes.unsigned_abs();
    if magnitude <= 1024 {
        format!("{} B", bytes)
    } else if magnitude < 1 << 20 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else if magnitude < 1 << 30 {
        format!("{:.2} MiB", bytes as f64 / (1u64 << 20) as f64)
    } else {
        format!("{:.2} GiB", bytes as f64 / (1u64 << 30) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_peak_tracks_high_water_mark() {
        let mut stat = Stat::default();
        stat.increase(10);
        stat.increase(5);
        stat.decrease(12);
        assert_eq!(stat.current, 3);
        assert_eq!(stat.peak, 15);
        assert_eq!(stat.allocated, 15);
        assert_eq!(stat.freed, 12);
        assert_eq!(stat.current, stat.allocated - stat.freed);
    }

    #[test]
    fn test_reset_peak_sets_current() {
        let mut stat = Stat::default();
        stat.increase(10);
        stat.decrease(4);
        stat.reset_peak();
        assert_eq!(stat.peak, 6);
        assert_eq!(stat.current, 6);
    }

    #[test]
    fn test_oversize_only_in_aggregate() {
        let mut stats = DeviceStats::new(64 << 20);
        let types = StatTypes::for_block(PoolKind::Large, true);
        stats.block_allocated(types, true, 64 << 20, 64 << 20);

        assert_eq!(stats.allocated[StatType::Aggregate as usize].current, 1);
        assert_eq!(stats.allocated[StatType::LargePool as usize].current, 0);
        assert_eq!(stats.allocated[StatType::SmallPool as usize].current, 0);
        assert_eq!(stats.oversize_allocations.current, 1);
    }

    #[test]
    fn test_small_block_partitions() {
        let mut stats = DeviceStats::new(usize::MAX);
        let types = StatTypes::for_block(PoolKind::Small, false);
        stats.block_allocated(types, false, 512, 100);
        assert_eq!(stats.allocated_bytes[StatType::SmallPool as usize].current, 512);
        assert_eq!(stats.requested_bytes[StatType::Aggregate as usize].current, 100);
        assert_eq!(stats.allocated_bytes[StatType::LargePool as usize].current, 0);
        assert_eq!(stats.oversize_allocations.current, 0);
    }

    #[test]
    fn test_reset_accumulated_keeps_current() {
        let mut stats = DeviceStats::new(usize::MAX);
        let types = StatTypes::for_block(PoolKind::Small, false);
        stats.block_allocated(types, false, 512, 512);
        stats.block_allocated(types, false, 512, 512);
        stats.block_freed(types, false, 512);
        stats.num_alloc_retries = 2;
        stats.num_ooms = 1;

        stats.reset_accumulated();
        let bytes = stats.allocated_bytes[StatType::Aggregate as usize];
        assert_eq!(bytes.allocated, 0);
        assert_eq!(bytes.freed, 0);
        assert_eq!(bytes.current, 512);
        assert_eq!(bytes.peak, 1024);
        assert_eq!(stats.num_alloc_retries, 0);
        assert_eq!(stats.num_ooms, 0);
    }

    #[test]
    fn test_inactive_split_delta() {
        let mut stats = DeviceStats::new(usize::MAX);
        let types = StatTypes::for_block(PoolKind::Large, false);
        stats.inactive_split_changed(types, 1, 4096);
        stats.inactive_split_changed(types, -1, -1024);
        assert_eq!(stats.inactive_split[0].current, 0);
        assert_eq!(stats.inactive_split_bytes[0].current, 3072);
        assert_eq!(stats.inactive_split_bytes[2].freed, 1024);
    }

    #[test]
    fn test_flat_keys_sorted_and_qualified() {
        let stats = DeviceStats::new(usize::MAX);
        let flat = stats.to_flat();
        let keys: Vec<&String> = flat.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert_eq!(flat["allocated_bytes.all.current"], 0);
        assert_eq!(flat["segment.large_pool.peak"], 0);
        assert_eq!(flat["oversize_segments.freed"], 0);
        assert_eq!(flat["max_split_size"], -1);
        assert!(flat.contains_key("num_alloc_retries"));
        // 9 metrics x 3 partitions x 4 fields + 2 oversize x 4 + 3 scalars
        assert_eq!(flat.len(), 9 * 3 * 4 + 8 + 3);
    }

    #[test]
    fn test_flatten_nested_value() {
        let value = json!({"b": {"y": 2, "x": 1}, "a": 0, "s": "skip"});
        let flat = flatten(&value);
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b.x", "b.y"]);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(20 << 20), "20.00 MiB");
        assert_eq!(format_size(5 << 30), "5.00 GiB");
    }
}
