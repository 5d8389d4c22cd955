//! Replay a random allocation workload against a simulated device
//!
//! Useful for eyeballing cache behaviour (reuse, fragmentation, deferred
//! frees) under a given `ROCMCACHE_ALLOC_CONF`-style setting string.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rocmcache::allocator::AllocatorConfig;
use rocmcache::backend::{DevicePtr, SimulatedDevice, StreamId};
use rocmcache::registry::AllocatorRegistry;
use rocmcache::summary::{summarize, write_snapshot};
use rocmcache::AllocatorError;

#[derive(Parser, Debug)]
#[command(name = "cache_replay", version)]
#[command(about = "Replay a random alloc/free workload through the caching allocator", long_about = None)]
struct Cli {
    /// Number of alloc/free steps
    #[arg(long, default_value_t = 10_000)]
    steps: usize,

    /// RNG seed, for reproducible runs
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Largest single request in bytes
    #[arg(long, default_value_t = 64 << 20)]
    max_size: u64,

    /// Per-process memory fraction for the device
    #[arg(long)]
    fraction: Option<f64>,

    /// Number of streams requests are spread over
    #[arg(long, default_value_t = 2)]
    streams: usize,

    /// Simulated device capacity in MiB
    #[arg(long, default_value_t = 4096)]
    capacity_mb: usize,

    /// Allocator settings, e.g. "max_split_size_mb:64,garbage_collection_threshold:0.8"
    #[arg(long)]
    alloc_conf: Option<String>,

    /// Write the final snapshot as JSON to this path
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Print the abbreviated summary
    #[arg(long)]
    abbreviated: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Default)]
struct ReplayCounts {
    allocs: usize,
    frees: usize,
    cross_stream: usize,
    ooms: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .parse()
        .context("invalid --log-level")?;
    rocmcache::init_with_config(&rocmcache::LoggingConfig::new().with_level(level))?;

    let device = Arc::new(SimulatedDevice::with_capacity(cli.capacity_mb << 20));
    let registry = AllocatorRegistry::new(device.clone());
    let config = match &cli.alloc_conf {
        Some(settings) => AllocatorConfig::parse(settings)?,
        None => AllocatorConfig::default(),
    };
    registry.configure(config)?;
    if let Some(fraction) = cli.fraction {
        registry.set_memory_fraction(fraction, 0)?;
    }

    let streams = cli.streams.max(1);
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut live: Vec<(DevicePtr, StreamId)> = Vec::new();
    let mut counts = ReplayCounts::default();
    let started = Instant::now();

    for _ in 0..cli.steps {
        let stream = StreamId(rng.gen_range(0..streams));
        if live.is_empty() || rng.gen_bool(0.55) {
            // Log-uniform sizes so small and large pools both see traffic.
            let exponent = rng.gen_range(0.0..(cli.max_size.max(2) as f64).log2());
            let size = 2f64.powf(exponent) as i64;
            match registry.allocate(size, 0, stream) {
                Ok(ptr) => {
                    counts.allocs += 1;
                    device.submit_work(0, stream);
                    live.push((ptr, stream));
                }
                Err(AllocatorError::OutOfMemory(_)) => counts.ooms += 1,
                Err(err) => return Err(err.into()),
            }
        } else {
            let (ptr, owner) = live.swap_remove(rng.gen_range(0..live.len()));
            if streams > 1 && rng.gen_bool(0.1) {
                let user = StreamId((owner.0 + 1) % streams);
                registry.record_stream(ptr, user)?;
                device.submit_work(0, user);
                counts.cross_stream += 1;
            }
            registry.deallocate(ptr)?;
            counts.frees += 1;
        }

        if rng.gen_bool(0.05) {
            device.complete_work(0, StreamId(rng.gen_range(0..streams)));
        }
    }
    let elapsed = started.elapsed();

    println!("{}", summarize(&registry, 0, cli.abbreviated)?);
    println!(
        "{} steps in {:?}: {} allocs, {} frees ({} cross-stream), {} OOMs, {} still live",
        cli.steps,
        elapsed,
        counts.allocs,
        counts.frees,
        counts.cross_stream,
        counts.ooms,
        live.len()
    );

    if let Some(path) = &cli.snapshot {
        write_snapshot(&registry.memory_snapshot()?, path)
            .with_context(|| format!("writing snapshot to {}", path.display()))?;
        println!("snapshot written to {}", path.display());
    }

    for (ptr, _) in live {
        registry.deallocate(ptr)?;
    }
    for stream in 0..streams {
        device.complete_work(0, StreamId(stream));
    }
    registry.synchronize()?;
    registry.empty_cache()?;
    Ok(())
}
