//! Observability for the sentiment engine
//!
//! Counters for fanout writes and queries plus a bounded fanout latency
//! window. `export()` flattens everything into a sorted map suitable for
//! Prometheus-style exposition.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Engine metrics, shared between the writer and the query service.
pub struct FanoutMetrics {
    // Writes
    pub measurements_received: AtomicU64,
    pub bucket_writes: AtomicU64,
    pub duplicate_writes: AtomicU64,
    pub write_retries: AtomicU64,
    pub resolution_failures: AtomicU64,
    pub partial_fanouts: AtomicU64,
    pub fanout_latency_us: Mutex<LatencyTracker>,

    // Reads
    pub queries: AtomicU64,
    pub read_retries: AtomicU64,
    pub expired_filtered: AtomicU64,
}

impl FanoutMetrics {
    pub fn new() -> Self {
        Self {
            measurements_received: AtomicU64::new(0),
            bucket_writes: AtomicU64::new(0),
            duplicate_writes: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            resolution_failures: AtomicU64::new(0),
            partial_fanouts: AtomicU64::new(0),
            fanout_latency_us: Mutex::new(LatencyTracker::new(1000)),
            queries: AtomicU64::new(0),
            read_retries: AtomicU64::new(0),
            expired_filtered: AtomicU64::new(0),
        }
    }

    pub fn record_measurement(&self) {
        self.measurements_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one applied bucket upsert.
    pub fn record_bucket_write(&self, duplicate: bool) {
        if duplicate {
            self.duplicate_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bucket_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_write_retries(&self, retries: u64) {
        self.write_retries.fetch_add(retries, Ordering::Relaxed);
    }

    /// Record the end of one fanout.
    pub fn record_fanout(&self, failed_resolutions: u64, latency_us: u64) {
        if failed_resolutions > 0 {
            self.resolution_failures.fetch_add(failed_resolutions, Ordering::Relaxed);
            self.partial_fanouts.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut tracker) = self.fanout_latency_us.lock() {
            tracker.record(latency_us);
        }
    }

    /// Record a served query, its retries and how many expired items it dropped.
    pub fn record_query(&self, retries: u64, expired: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.read_retries.fetch_add(retries, Ordering::Relaxed);
        self.expired_filtered.fetch_add(expired, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("measurements_received".to_string(), self.measurements_received.load(Ordering::Relaxed));
        m.insert("bucket_writes".to_string(), self.bucket_writes.load(Ordering::Relaxed));
        m.insert("duplicate_writes".to_string(), self.duplicate_writes.load(Ordering::Relaxed));
        m.insert("write_retries".to_string(), self.write_retries.load(Ordering::Relaxed));
        m.insert("resolution_failures".to_string(), self.resolution_failures.load(Ordering::Relaxed));
        m.insert("partial_fanouts".to_string(), self.partial_fanouts.load(Ordering::Relaxed));
        m.insert("queries".to_string(), self.queries.load(Ordering::Relaxed));
        m.insert("read_retries".to_string(), self.read_retries.load(Ordering::Relaxed));
        m.insert("expired_filtered".to_string(), self.expired_filtered.load(Ordering::Relaxed));
        if let Ok(tracker) = self.fanout_latency_us.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("fanout_latency_p50_us".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("fanout_latency_p99_us".to_string(), p99);
            }
        }
        m
    }
}

impl Default for FanoutMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    /// Record a latency sample, evicting the oldest when full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }
}
