//! Loader metrics
//!
//! Lock-free counters plus a block-load latency histogram. Exported as
//! Prometheus text or as a serializable [`MetricsSnapshot`].

use serde::Serialize;
use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds (seconds) of the block-load latency buckets
///
/// A cache hit is a file read plus checksum; a miss decodes and resizes
/// every image in the block, so the range spans both.
pub const BLOCK_LOAD_BOUNDS: [f64; 8] = [0.001, 0.005, 0.025, 0.1, 0.25, 1.0, 5.0, 30.0];

/// Monotonic event count
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn write_prometheus(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "# HELP {} {}", self.name, self.help)?;
        writeln!(out, "# TYPE {} counter", self.name)?;
        writeln!(out, "{} {}", self.name, self.get())
    }
}

/// Cumulative latency histogram over [`BLOCK_LOAD_BOUNDS`]
pub struct LatencyHistogram {
    name: &'static str,
    help: &'static str,
    buckets: [AtomicU64; BLOCK_LOAD_BOUNDS.len()],
    total_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        for (bound, bucket) in BLOCK_LOAD_BOUNDS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run `f`, recording how long it took
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record(start.elapsed());
        result
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed))
    }

    fn write_prometheus(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "# HELP {} {}", self.name, self.help)?;
        writeln!(out, "# TYPE {} histogram", self.name)?;
        for (bound, bucket) in BLOCK_LOAD_BOUNDS.iter().zip(&self.buckets) {
            writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            )?;
        }
        writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count())?;
        writeln!(out, "{}_sum {}", self.name, self.total().as_secs_f64())?;
        writeln!(out, "{}_count {}", self.name, self.count())
    }
}

/// Point-in-time copy of a loader's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_produced: u64,
    pub records_processed: u64,
    pub records_substituted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_writes: u64,
    pub blocks_loaded: u64,
    pub block_load_seconds: f64,
}

/// Per-loader metrics
pub struct LoaderMetrics {
    pub batches_produced: Counter,
    pub records_processed: Counter,
    pub records_substituted: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_writes: Counter,
    pub block_load_duration: LatencyHistogram,
}

impl LoaderMetrics {
    pub fn new() -> Self {
        Self {
            batches_produced: Counter::new(
                "vortex_etl_batches_produced_total",
                "Batches yielded by the loader",
            ),
            records_processed: Counter::new(
                "vortex_etl_records_processed_total",
                "Non-padding records yielded by the loader",
            ),
            records_substituted: Counter::new(
                "vortex_etl_records_substituted_total",
                "Fields replaced with zeros after a decode failure",
            ),
            cache_hits: Counter::new("vortex_etl_cache_hits_total", "Blocks read from cache"),
            cache_misses: Counter::new(
                "vortex_etl_cache_misses_total",
                "Blocks computed from the manifest",
            ),
            cache_writes: Counter::new("vortex_etl_cache_writes_total", "Blocks written to cache"),
            block_load_duration: LatencyHistogram::new(
                "vortex_etl_block_load_duration_seconds",
                "Block load latency (cache read or transform)",
            ),
        }
    }

    fn counters(&self) -> [&Counter; 6] {
        [
            &self.batches_produced,
            &self.records_processed,
            &self.records_substituted,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_writes,
        ]
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_produced: self.batches_produced.get(),
            records_processed: self.records_processed.get(),
            records_substituted: self.records_substituted.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_writes: self.cache_writes.get(),
            blocks_loaded: self.block_load_duration.count(),
            block_load_seconds: self.block_load_duration.total().as_secs_f64(),
        }
    }

    /// Write every metric in Prometheus text exposition format
    pub fn write_prometheus(&self, out: &mut impl Write) -> fmt::Result {
        for counter in self.counters() {
            counter.write_prometheus(out)?;
        }
        self.block_load_duration.write_prometheus(out)
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.write_prometheus(&mut out);
        out
    }
}

impl Default for LoaderMetrics {
    fn default() -> Self {
        Self::new()
    }
}
