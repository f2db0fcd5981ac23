//! Operation counters for the adapter.
//!
//! All counters are lock-free atomics; a [`StatsSnapshot`] can be taken at
//! any time and serialized for logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::FsErrorKind;

/// Total nanoseconds and count, for average latency.
#[derive(Debug, Default)]
pub struct LatencyStats {
    total_nanos: AtomicU64,
    count: AtomicU64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in microseconds, 0.0 before the first sample.
    pub fn avg_micros(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_nanos.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }
}

#[derive(Debug)]
pub struct AdapterStats {
    pub metadata_ops: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub commits: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
    /// Subset of `errors` that were stale handles.
    pub stale_handles: AtomicU64,
    metadata_latency: LatencyStats,
    read_latency: LatencyStats,
    write_latency: LatencyStats,
    last_activity: RwLock<Instant>,
}

impl Default for AdapterStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterStats {
    pub fn new() -> Self {
        Self {
            metadata_ops: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            stale_handles: AtomicU64::new(0),
            metadata_latency: LatencyStats::new(),
            read_latency: LatencyStats::new(),
            write_latency: LatencyStats::new(),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_metadata_op(&self, elapsed: Duration) {
        self.metadata_ops.fetch_add(1, Ordering::Relaxed);
        self.metadata_latency.record(elapsed);
        self.touch();
    }

    #[inline]
    pub fn record_read(&self, bytes: u64, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.read_latency.record(elapsed);
        self.touch();
    }

    #[inline]
    pub fn record_write(&self, bytes: u64, elapsed: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.write_latency.record(elapsed);
        self.touch();
    }

    #[inline]
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self, kind: FsErrorKind) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if kind == FsErrorKind::StaleHandle {
            self.stale_handles.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last recorded operation.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            metadata_ops: self.metadata_ops.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            stale_handles: self.stale_handles.load(Ordering::Relaxed),
            avg_metadata_micros: self.metadata_latency.avg_micros(),
            avg_read_micros: self.read_latency.avg_micros(),
            avg_write_micros: self.write_latency.avg_micros(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub metadata_ops: u64,
    pub reads: u64,
    pub writes: u64,
    pub commits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub stale_handles: u64,
    pub avg_metadata_micros: f64,
    pub avg_read_micros: f64,
    pub avg_write_micros: f64,
}
