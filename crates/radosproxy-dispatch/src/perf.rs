//! Dispatch counters and latency tracking

use parking_lot::{Condvar, Mutex};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;

/// Latency histogram for percentile calculations
///
/// Uses logarithmic buckets:
/// - Bucket 0: 0-10us
/// - Bucket 1: 10-20us
/// - Bucket 2: 20-50us
/// - Bucket 3: 50-100us
/// - Bucket 4: 100-200us
/// - Bucket 5: 200-500us
/// - Bucket 6: 500us-1ms
/// - Bucket 7: 1-2ms
/// - Bucket 8: 2-5ms
/// - Bucket 9: 5-10ms
/// - Bucket 10: 10-20ms
/// - Bucket 11: 20-50ms
/// - Bucket 12: 50-100ms
/// - Bucket 13: 100-200ms
/// - Bucket 14: 200-500ms
/// - Bucket 15: 500ms+
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 16],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

/// Bucket upper bounds in microseconds
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    50_000,
    100_000,
    200_000,
    500_000,
    u64::MAX,
];

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record a sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let bucket_idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(15);

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.min.fetch_min(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Record a duration, saturating at `u64::MAX` microseconds
    pub fn record_duration(&self, elapsed: Duration) {
        self.record(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn avg(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum() / count
    }

    pub fn min(&self) -> u64 {
        let min = self.min.load(Ordering::Relaxed);
        if min == u64::MAX { 0 } else { min }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding `percentile` (0.0 to 1.0)
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        BUCKET_BOUNDARIES_US[15]
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    /// `(upper bound, count)` per bucket
    pub fn bucket_counts(&self) -> Vec<(u64, u64)> {
        BUCKET_BOUNDARIES_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&boundary, count)| (boundary, count.load(Ordering::Relaxed)))
            .collect()
    }

    /// Write the histogram in Prometheus histogram format
    #[allow(clippy::cast_precision_loss)]
    pub fn export_prometheus(&self, output: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        let mut cumulative = 0u64;
        for (boundary_us, count) in self.bucket_counts() {
            cumulative += count;
            if boundary_us == u64::MAX {
                continue;
            }
            let le = boundary_us as f64 / 1_000_000.0;
            let _ = writeln!(output, "{name}_bucket{{{labels}{sep}le=\"{le}\"}} {cumulative}");
        }
        let _ = writeln!(output, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {}", self.count());
        let sum_secs = self.sum() as f64 / 1_000_000.0;
        let _ = writeln!(output, "{name}_sum{{{labels}}} {sum_secs}");
        let _ = writeln!(output, "{name}_count{{{labels}}} {}", self.count());
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one worker pool
#[derive(Debug, Default)]
pub struct DispatchStats {
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    batches: AtomicU64,
    /// Time from enqueue to processing start
    pub queue_wait: LatencyHistogram,
    /// Time from the producer's offer to completion
    pub op_life: LatencyHistogram,
}

/// Point-in-time copy of [`DispatchStats`] counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub batches: u64,
    pub queue_wait_sum_us: u64,
    pub op_life_sum_us: u64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, ok: bool) {
        if ok {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            queue_wait_sum_us: self.queue_wait.sum(),
            op_life_sum_us: self.op_life.sum(),
        }
    }

    /// Completed items, successful or not
    pub fn completed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    /// Append Prometheus text for this pool, labelled `pool="<name>"`
    pub fn export_prometheus(&self, output: &mut String, prefix: &str, pool: &str) {
        let s = self.snapshot();
        let labels = format!("pool=\"{pool}\"");
        for (name, help, value) in [
            ("enqueued_total", "Items accepted into a queue", s.enqueued),
            ("processed_total", "Items processed successfully", s.processed),
            ("failed_total", "Items completed with an error", s.failed),
            ("rejected_total", "Items rejected after shutdown", s.rejected),
            ("batches_total", "Drained batches", s.batches),
        ] {
            let _ = writeln!(output, "# HELP {prefix}_{name} {help}");
            let _ = writeln!(output, "# TYPE {prefix}_{name} counter");
            let _ = writeln!(output, "{prefix}_{name}{{{labels}}} {value}");
        }
        let _ = writeln!(output, "# TYPE {prefix}_queue_wait_seconds histogram");
        self.queue_wait
            .export_prometheus(output, &format!("{prefix}_queue_wait_seconds"), &labels);
        let _ = writeln!(output, "# TYPE {prefix}_op_life_seconds histogram");
        self.op_life
            .export_prometheus(output, &format!("{prefix}_op_life_seconds"), &labels);
    }
}

/// Periodically logs average queue wait and op lifetime for one pool,
/// skipping intervals with no completed work
pub struct PerfReporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PerfReporter {
    pub fn start(name: &str, stats: Arc<DispatchStats>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("{name}-perf"))
            .spawn(move || {
                let mut last = stats.snapshot();
                loop {
                    {
                        let (lock, cvar) = &*thread_stop;
                        let mut stopped = lock.lock();
                        if !*stopped {
                            let _ = cvar.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    let now = stats.snapshot();
                    if let Some(line) = perf_line(&label, &last, &now) {
                        info!("{}", line);
                    }
                    last = now;
                }
            })?;
        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PerfReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Summary of the work done between two snapshots, if any
fn perf_line(name: &str, before: &DispatchSnapshot, after: &DispatchSnapshot) -> Option<String> {
    let done = (after.processed + after.failed).saturating_sub(before.processed + before.failed);
    if done == 0 {
        return None;
    }
    let wait = after.queue_wait_sum_us.saturating_sub(before.queue_wait_sum_us) / done;
    let life = after.op_life_sum_us.saturating_sub(before.op_life_sum_us) / done;
    Some(format!(
        "perf {name}: ops={done} failed={} avg_queue_wait={wait}us avg_op_life={life}us",
        after.failed.saturating_sub(before.failed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_histogram_basic() {
        let histogram = LatencyHistogram::new();
        histogram.record(5);
        histogram.record(15);
        histogram.record(150);
        histogram.record(1500);

        assert_eq!(histogram.count(), 4);
        assert_eq!(histogram.min(), 5);
        assert_eq!(histogram.max(), 1500);
        assert_eq!(histogram.avg(), (5 + 15 + 150 + 1500) / 4);
    }

    #[test]
    fn test_latency_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..99 {
            histogram.record(5);
        }
        histogram.record(300_000);
        assert_eq!(histogram.p50(), 10);
        assert_eq!(histogram.percentile(1.0), 500_000);
    }

    #[test]
    fn test_record_duration_saturates() {
        let histogram = LatencyHistogram::new();
        histogram.record_duration(Duration::from_millis(2));
        assert_eq!(histogram.sum(), 2_000);
    }

    #[test]
    fn test_prometheus_export() {
        let stats = DispatchStats::new();
        stats.record_enqueued();
        stats.record_result(true);
        stats.queue_wait.record(30);
        let mut out = String::new();
        stats.export_prometheus(&mut out, "radosproxy_dispatch", "proxy");
        assert!(out.contains("radosproxy_dispatch_processed_total{pool=\"proxy\"} 1"));
        assert!(out.contains("radosproxy_dispatch_queue_wait_seconds_bucket{pool=\"proxy\",le=\"+Inf\"} 1"));
        assert!(out.contains("radosproxy_dispatch_op_life_seconds_count{pool=\"proxy\"} 0"));
    }

    #[test]
    fn test_perf_line_skips_idle_intervals() {
        let before = DispatchSnapshot::default();
        assert!(perf_line("p", &before, &before).is_none());
        let after = DispatchSnapshot {
            processed: 3,
            failed: 1,
            queue_wait_sum_us: 400,
            op_life_sum_us: 800,
            ..before
        };
        let line = perf_line("p", &before, &after).unwrap();
        assert!(line.contains("ops=4"));
        assert!(line.contains("avg_queue_wait=100us"));
        assert!(line.contains("avg_op_life=200us"));
    }

    #[test]
    fn test_reporter_stops_promptly() {
        let stats = Arc::new(DispatchStats::new());
        let reporter = PerfReporter::start("test", stats, Duration::from_secs(3600)).unwrap();
        let begin = std::time::Instant::now();
        reporter.stop();
        reporter.stop();
        assert!(begin.elapsed() < Duration::from_secs(5));
    }
}
