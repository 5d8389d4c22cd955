//! Caching allocator benchmarks
//!
//! Measures the hot paths against the simulated device:
//! - cache hits for small and large requests
//! - cold reservations (cache emptied every iteration)
//! - split-heavy mixed-size workloads
//! - cross-stream frees reclaimed by polling
//!
//! Run with: `cargo bench --bench allocator_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rocmcache::allocator::{Allocator, AllocatorConfig, NativeCachingAllocator};
use rocmcache::backend::{DevicePtr, SimulatedDevice, StreamId};

// ============================================================================
// Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        if self.durations.is_empty() {
            return;
        }
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.durations.len() as u32;

        let mut sorted = self.durations.clone();
        sorted.sort();
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.durations.len());
        println!("Average: {:?}", avg);
        println!("Min:     {:?}", min);
        println!("Max:     {:?}", max);
        println!("P50:     {:?}", p50);
        println!("P99:     {:?}", p99);
    }
}

fn allocator(config: AllocatorConfig) -> (Arc<SimulatedDevice>, NativeCachingAllocator) {
    let device = Arc::new(SimulatedDevice::new(1, 16 << 30));
    let alloc = NativeCachingAllocator::new(device.clone(), config)
        .unwrap_or_else(|err| panic!("allocator setup failed: {}", err));
    (device, alloc)
}

fn alloc_or_panic(alloc: &NativeCachingAllocator, size: usize, stream: StreamId) -> DevicePtr {
    alloc
        .raw_alloc(size, 0, stream)
        .unwrap_or_else(|err| panic!("allocation of {} bytes failed: {}", size, err))
}

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_cache_hits() {
    println!("\n[Cache Hits]");
    let (_, alloc) = allocator(AllocatorConfig::default());

    for (label, size) in [("small 4 KiB", 4usize << 10), ("large 8 MiB", 8 << 20)] {
        let bench = Benchmark::new(&format!("alloc+free {}", label), 10_000);
        bench
            .run(|| {
                let ptr = alloc_or_panic(&alloc, size, StreamId::DEFAULT);
                alloc.raw_delete(ptr).ok();
            })
            .report();
    }
}

fn benchmark_cold_reservations() {
    println!("\n[Cold Reservations]");
    let (_, alloc) = allocator(AllocatorConfig::default());

    let bench = Benchmark::new("alloc+free+empty_cache 32 MiB", 2_000);
    bench
        .run(|| {
            let ptr = alloc_or_panic(&alloc, 32 << 20, StreamId::DEFAULT);
            alloc.raw_delete(ptr).ok();
            alloc.empty_cache().ok();
        })
        .report();
}

fn benchmark_mixed_sizes() {
    println!("\n[Mixed Sizes]");
    for (label, config) in [
        ("default", AllocatorConfig::default()),
        (
            "roundup_power2_divisions:4",
            AllocatorConfig::default().with_roundup_power2_divisions(4),
        ),
    ] {
        let (_, alloc) = allocator(config);
        let sizes: Vec<usize> = (0..64).map(|i| 512 + i * 37_000).collect();
        let bench = Benchmark::new(&format!("64 mixed allocs then frees ({})", label), 500);
        bench
            .run(|| {
                let ptrs: Vec<_> = sizes
                    .iter()
                    .map(|&size| alloc_or_panic(&alloc, size, StreamId::DEFAULT))
                    .collect();
                for ptr in ptrs {
                    alloc.raw_delete(ptr).ok();
                }
            })
            .report();

        if let Ok(stats) = alloc.memory_stats(0) {
            println!(
                "  segments reserved: {}, retries: {}",
                stats.segment[0].allocated, stats.num_alloc_retries
            );
        }
    }
}

fn benchmark_cross_stream_frees() {
    println!("\n[Cross-Stream Frees]");
    let (device, alloc) = allocator(AllocatorConfig::default());
    let consumer = StreamId(1);

    let bench = Benchmark::new("record_stream + free + poll 64 KiB", 5_000);
    bench
        .run(|| {
            let ptr = alloc_or_panic(&alloc, 64 << 10, StreamId::DEFAULT);
            alloc.record_stream(ptr, consumer).ok();
            device.submit_work(0, consumer);
            alloc.raw_delete(ptr).ok();
            device.complete_work(0, consumer);
        })
        .report();
    alloc.synchronize().ok();
}

fn main() {
    println!("====================================");
    println!("rocmcache Allocator Benchmark Suite");
    println!("====================================");

    benchmark_cache_hits();
    benchmark_cold_reservations();
    benchmark_mixed_sizes();
    benchmark_cross_stream_frees();

    println!("\n====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
