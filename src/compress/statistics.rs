use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Run-wide totals shared by every upload unit.
///
/// Counters are independent atomics and may be momentarily inconsistent with
/// each other while workers are adding; they are end-of-run tallies only.
#[derive(Debug)]
pub struct CompressStatistics {
    total_size: AtomicU64,
    compressed_size: AtomicU64,
    file_count: AtomicU64,
    start_time: RwLock<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub elapsed_ms: u64,
    pub total_size: u64,
    pub compressed_size: u64,
    pub file_count: u64,
}

impl CompressStatistics {
    pub fn new() -> Self {
        Self {
            total_size: AtomicU64::new(0),
            compressed_size: AtomicU64::new(0),
            file_count: AtomicU64::new(0),
            start_time: RwLock::new(Instant::now()),
        }
    }

    pub fn add_total_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn add_compressed_size(&self, size: u64) {
        self.compressed_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn add_file_count(&self, count: u64) {
        self.file_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size.load(Ordering::Relaxed)
    }

    pub fn file_count(&self) -> u64 {
        self.file_count.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.read().elapsed()
    }

    /// Restart the elapsed-time baseline, keeping the counters
    pub fn start_timer(&self) {
        *self.start_time.write() = Instant::now();
    }

    pub fn reset(&self) {
        let mut start = self.start_time.write();
        self.total_size.store(0, Ordering::Relaxed);
        self.compressed_size.store(0, Ordering::Relaxed);
        self.file_count.store(0, Ordering::Relaxed);
        *start = Instant::now();
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            elapsed_ms: self.elapsed().as_millis() as u64,
            total_size: self.total_size(),
            compressed_size: self.compressed_size(),
            file_count: self.file_count(),
        }
    }
}

impl Default for CompressStatistics {
    fn default() -> Self {
        Self::new()
    }
}
