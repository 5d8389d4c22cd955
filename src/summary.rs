//! Human-readable reports and snapshot persistence
//!
//! Consumers of the allocator: everything here goes through the public
//! registry queries and never touches allocator internals.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::allocator::{DeviceStats, MemorySnapshot, StatArray, StatType};
use crate::backend::DeviceIndex;
use crate::error::AllocatorError;
use crate::registry::{self, AllocatorRegistry};

const RULE_WIDTH: usize = 75;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error("failed to write snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Bytes,
    Count,
}

impl Unit {
    /// Ten-column cell; the prefix is chosen from `reference` so a row of
    /// partitions shares one scale
    fn cell(self, value: i64, reference: i64) -> String {
        match self {
            Unit::Bytes => {
                const PREFIXES: [&str; 6] = ["B  ", "KiB", "MiB", "GiB", "TiB", "PiB"];
                let (mut value, mut reference, mut prefix) = (value, reference, PREFIXES[0]);
                for next in &PREFIXES[1..] {
                    if reference < 768 * 1024 {
                        break;
                    }
                    prefix = next;
                    value /= 1024;
                    reference /= 1024;
                }
                format!("{:>6} {}", value, prefix)
            }
            Unit::Count => {
                const PREFIXES: [&str; 3] = [" ", "K", "M"];
                let (mut value, mut reference, mut prefix) = (value, reference, PREFIXES[0]);
                for next in &PREFIXES[1..] {
                    if reference < 750 * 1000 {
                        break;
                    }
                    prefix = next;
                    value /= 1000;
                    reference /= 1000;
                }
                format!("{:>7} {} ", value, prefix)
            }
        }
    }
}

fn row(name: &str, unit: Unit, value: [i64; 4], reference: [i64; 4]) -> String {
    format!(
        " {:<21} | {} | {} | {} | {} ",
        name,
        unit.cell(value[0], reference[0]),
        unit.cell(value[1], reference[1]),
        unit.cell(value[2], reference[2]),
        unit.cell(value[3], reference[3]),
    )
}

/// Render `stats` as a fixed-width table
///
/// The abbreviated form drops the per-pool rows.
pub fn format_summary(stats: &DeviceStats, device: DeviceIndex, abbreviated: bool) -> String {
    let metrics: [(&StatArray, &str, Unit); 9] = [
        (&stats.allocated_bytes, "Allocated memory", Unit::Bytes),
        (&stats.active_bytes, "Active memory", Unit::Bytes),
        (&stats.requested_bytes, "Requested memory", Unit::Bytes),
        (&stats.reserved_bytes, "Reserved memory", Unit::Bytes),
        (&stats.inactive_split_bytes, "Non-releasable memory", Unit::Bytes),
        (&stats.allocated, "Allocations", Unit::Count),
        (&stats.active, "Active allocs", Unit::Count),
        (&stats.segment, "Reserved segments", Unit::Count),
        (&stats.inactive_split, "Non-releasable allocs", Unit::Count),
    ];

    let mut lines = vec![
        "=".repeat(RULE_WIDTH),
        format!(" {:19} rocmcache memory summary, device ID {:<17} ", "", device),
        "-".repeat(RULE_WIDTH),
        format!(
            "  {:7} Device OOMs: {:<12} | {:9} Reserve retries: {:<8}  ",
            "", stats.num_ooms, "", stats.num_alloc_retries
        ),
        "=".repeat(RULE_WIDTH),
        "        Metric         | Cur Usage  | Peak Usage | Tot Alloc  | Tot Freed  ".to_string(),
    ];

    for (array, name, unit) in metrics {
        lines.push("-".repeat(RULE_WIDTH));
        let all = array[StatType::Aggregate as usize].fields();
        lines.push(row(name, unit, all, all));
        if !abbreviated {
            for (stat_type, label) in [
                (StatType::LargePool, "      from large pool"),
                (StatType::SmallPool, "      from small pool"),
            ] {
                lines.push(row(label, unit, array[stat_type as usize].fields(), all));
            }
        }
    }

    for (stat, name) in [
        (&stats.oversize_allocations, "Oversize allocations"),
        (&stats.oversize_segments, "Oversize segments"),
    ] {
        lines.push("-".repeat(RULE_WIDTH));
        let fields = stat.fields();
        lines.push(row(name, Unit::Count, fields, fields));
    }
    lines.push("=".repeat(RULE_WIDTH));

    let mut out = String::new();
    for line in lines {
        out.push('|');
        out.push_str(&line);
        out.push_str("|\n");
    }
    out
}

/// Summary of `device` in `registry`; all zeros before first use
pub fn summarize(
    registry: &AllocatorRegistry,
    device: DeviceIndex,
    abbreviated: bool,
) -> Result<String, SummaryError> {
    let stats = registry
        .device_stats(device)?
        .unwrap_or_else(|| DeviceStats::new(usize::MAX));
    Ok(format_summary(&stats, device, abbreviated))
}

/// Summary of `device` in the process-wide allocator
pub fn memory_summary(device: DeviceIndex, abbreviated: bool) -> Result<String, SummaryError> {
    summarize(registry::global(), device, abbreviated)
}

/// Write `snapshot` to `path` as pretty-printed JSON
pub fn write_snapshot(snapshot: &MemorySnapshot, path: impl AsRef<Path>) -> Result<(), SummaryError> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writer.flush()?;
    tracing::debug!(
        "wrote snapshot with {} segment(s) to {}",
        snapshot.segments.len(),
        path.display()
    );
    Ok(())
}

/// Snapshot the process-wide allocator into `path`
pub fn dump_snapshot(path: impl AsRef<Path>) -> Result<(), SummaryError> {
    let snapshot = registry::global().memory_snapshot()?;
    write_snapshot(&snapshot, path)
}
