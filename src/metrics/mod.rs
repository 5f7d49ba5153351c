//! Metrics sink (C11): thread-safe counters and gauges for the ingestion
//! pipeline, queried via `snapshot()`. Scalars are plain atomics; the one
//! multi-word update (per-format transcode duration+count) is behind a
//! narrow `Mutex` rather than reached for lock-free tricks (spec §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct FormatTiming {
    count: u64,
    total: Duration,
}

pub struct Metrics {
    downloads_started: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    bytes_fetched: AtomicU64,
    transcode_timings: Mutex<HashMap<String, FormatTiming>>,
    errors_by_category: Mutex<HashMap<String, u64>>,
    queue_pending: AtomicI64,
    queue_in_progress: AtomicI64,
    queue_retrying: AtomicI64,
    /// Fed by the C12 event-bus subscriber wired in `main`, independent of
    /// the direct per-stage counters above (spec §4.9).
    items_completed_events: AtomicU64,
    retention_bytes_freed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub downloads_started: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub bytes_fetched: u64,
    pub transcode_counts: HashMap<String, u64>,
    pub transcode_average_duration: HashMap<String, Duration>,
    pub errors_by_category: HashMap<String, u64>,
    pub queue_pending: i64,
    pub queue_in_progress: i64,
    pub queue_retrying: i64,
    pub items_completed_events: u64,
    pub retention_bytes_freed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            downloads_started: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            transcode_timings: Mutex::new(HashMap::new()),
            errors_by_category: Mutex::new(HashMap::new()),
            queue_pending: AtomicI64::new(0),
            queue_in_progress: AtomicI64::new(0),
            queue_retrying: AtomicI64::new(0),
            items_completed_events: AtomicU64::new(0),
            retention_bytes_freed: AtomicU64::new(0),
        }
    }

    /// Recorded by the C12 event-bus subscriber on `Event::ItemCompleted`.
    pub fn record_item_completed_event(&self) {
        self.items_completed_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Recorded by the C12 event-bus subscriber on `Event::ChannelRetentionRan`.
    pub fn record_retention_event(&self, freed_bytes: u64) {
        self.retention_bytes_freed.fetch_add(freed_bytes, Ordering::Relaxed);
    }

    pub fn download_started(&self) {
        self.downloads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_completed(&self, bytes: u64) {
        self.downloads_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn download_failed(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transcode(&self, format: &str, elapsed: Duration) {
        let mut timings = self.transcode_timings.lock().expect("metrics lock poisoned");
        let entry = timings.entry(format.to_string()).or_default();
        entry.count += 1;
        entry.total += elapsed;
    }

    pub fn record_error(&self, category: &str) {
        let mut errors = self.errors_by_category.lock().expect("metrics lock poisoned");
        *errors.entry(category.to_string()).or_insert(0) += 1;
    }

    pub fn set_queue_gauges(&self, pending: i64, in_progress: i64, retrying: i64) {
        self.queue_pending.store(pending, Ordering::Relaxed);
        self.queue_in_progress.store(in_progress, Ordering::Relaxed);
        self.queue_retrying.store(retrying, Ordering::Relaxed);
    }

    /// A consistent copy of all counters. Not atomic across fields as a
    /// whole — only each individual counter is linearizable — which matches
    /// the spec's "averages computed against the snapshot's counts"
    /// requirement rather than a stronger cross-field guarantee.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timings = self.transcode_timings.lock().expect("metrics lock poisoned");
        let transcode_counts = timings.iter().map(|(k, v)| (k.clone(), v.count)).collect();
        let transcode_average_duration = timings
            .iter()
            .map(|(k, v)| {
                let avg = if v.count > 0 {
                    v.total / v.count as u32
                } else {
                    Duration::ZERO
                };
                (k.clone(), avg)
            })
            .collect();
        let errors_by_category = self
            .errors_by_category
            .lock()
            .expect("metrics lock poisoned")
            .clone();

        MetricsSnapshot {
            downloads_started: self.downloads_started.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            transcode_counts,
            transcode_average_duration,
            errors_by_category,
            queue_pending: self.queue_pending.load(Ordering::Relaxed),
            queue_in_progress: self.queue_in_progress.load(Ordering::Relaxed),
            queue_retrying: self.queue_retrying.load(Ordering::Relaxed),
            items_completed_events: self.items_completed_events.load(Ordering::Relaxed),
            retention_bytes_freed: self.retention_bytes_freed.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = Metrics::new();
        metrics.download_started();
        metrics.download_started();
        metrics.download_completed(1024);
        metrics.download_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.downloads_started, 2);
        assert_eq!(snapshot.downloads_completed, 1);
        assert_eq!(snapshot.downloads_failed, 1);
        assert_eq!(snapshot.bytes_fetched, 1024);
    }

    #[test]
    fn transcode_average_divides_total_by_count() {
        let metrics = Metrics::new();
        metrics.record_transcode("audio", Duration::from_secs(2));
        metrics.record_transcode("audio", Duration::from_secs(4));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transcode_counts["audio"], 2);
        assert_eq!(snapshot.transcode_average_duration["audio"], Duration::from_secs(3));
    }

    #[test]
    fn queue_gauges_reflect_latest_set_call() {
        let metrics = Metrics::new();
        metrics.set_queue_gauges(5, 2, 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_pending, 5);
        assert_eq!(snapshot.queue_in_progress, 2);
        assert_eq!(snapshot.queue_retrying, 1);
    }

    #[test]
    fn event_driven_counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.record_item_completed_event();
        metrics.record_item_completed_event();
        metrics.record_retention_event(1024);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_completed_events, 2);
        assert_eq!(snapshot.retention_bytes_freed, 1024);
    }
}
