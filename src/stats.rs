use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;

/// Live counters shared by every worker of one run.
///
/// `sent` and `completed` are interval counters: [`MetricsAggregator::snapshot`]
/// swaps them back to zero. `open_connections` is a gauge and is only read.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    sent: AtomicU64,
    completed: AtomicU64,
    open_connections: AtomicU64,
}

/// Point-in-time view of a [`MetricsAggregator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub completed: u64,
    pub open_connections: u64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one more open connection until the returned guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> OpenConnection {
        self.open_connections.fetch_add(1, Ordering::AcqRel);
        OpenConnection {
            metrics: Arc::clone(self),
        }
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Acquire)
    }

    /// Reads and resets the interval counters.
    ///
    /// Each counter is taken with a single `swap`, so an increment racing with
    /// the snapshot lands either in this snapshot or in the next one, never both
    /// and never neither.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.swap(0, Ordering::AcqRel),
            completed: self.completed.swap(0, Ordering::AcqRel),
            open_connections: self.open_connections.load(Ordering::Acquire),
        }
    }
}

/// Gauge guard for one live connection.
///
/// Dropping it decrements `open_connections` exactly once, which also covers
/// workers aborted after the shutdown grace period.
#[derive(Debug)]
pub struct OpenConnection {
    metrics: Arc<MetricsAggregator>,
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.metrics.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Round-trip latencies of successful probes, in microseconds.
///
/// Every worker owns one of these; they are merged once the worker returns.
#[derive(Debug, Clone)]
pub struct Latency {
    histogram: Histogram<u64>,
}

impl Default for Latency {
    fn default() -> Self {
        Self::new()
    }
}

impl Latency {
    pub fn new() -> Self {
        Latency {
            // Three significant figures is always a valid precision.
            histogram: Histogram::<u64>::new(3).expect("Failed to create histogram"),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(micros);
    }

    pub fn merge(&mut self, other: &Latency) {
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("dropping worker latencies: {}", e);
        }
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.histogram.mean() / 1_000_000.0)
    }

    pub fn min(&self) -> Duration {
        Duration::from_micros(self.histogram.min())
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.histogram.max())
    }

    pub fn quantile(&self, q: f64) -> Duration {
        Duration::from_micros(self.histogram.value_at_quantile(q))
    }
}

/// Totals of a finished run: the sum of every interval snapshot.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub sent: u64,
    pub completed: u64,
    /// Gauge value after every worker returned.
    pub open_connections: u64,
    pub latency: Latency,
    /// Workers that missed the shutdown grace period and were aborted.
    pub aborted_workers: usize,
    /// Jobs still queued when the workers were aborted; included in `sent`.
    pub abandoned_jobs: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn absorb(&mut self, snapshot: &MetricsSnapshot) {
        self.sent += snapshot.sent;
        self.completed += snapshot.completed;
        self.open_connections = snapshot.open_connections;
    }

    pub fn success_rate(&self) -> f64 {
        if self.sent > 0 {
            (self.completed as f64 / self.sent as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn failed(&self) -> u64 {
        self.sent.saturating_sub(self.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_interval_counters_but_not_gauge() {
        let metrics = Arc::new(MetricsAggregator::new());
        metrics.record_sent();
        metrics.record_sent();
        metrics.record_completed();
        let _conn = metrics.connection_opened();

        let first = metrics.snapshot();
        assert_eq!(
            first,
            MetricsSnapshot {
                sent: 2,
                completed: 1,
                open_connections: 1
            }
        );

        let second = metrics.snapshot();
        assert_eq!(second.sent, 0);
        assert_eq!(second.completed, 0);
        assert_eq!(second.open_connections, 1);
    }

    #[test]
    fn dropping_guard_closes_connection_once() {
        let metrics = Arc::new(MetricsAggregator::new());
        let a = metrics.connection_opened();
        let b = metrics.connection_opened();
        assert_eq!(metrics.open_connections(), 2);
        drop(a);
        assert_eq!(metrics.open_connections(), 1);
        drop(b);
        assert_eq!(metrics.open_connections(), 0);
    }

    #[test]
    fn concurrent_increments_are_never_lost_across_snapshots() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 20_000;

        let metrics = Arc::new(MetricsAggregator::new());
        let writers: Vec<_> = (0..THREADS)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        metrics.record_sent();
                        metrics.record_completed();
                    }
                })
            })
            .collect();

        let mut summary = RunSummary::default();
        while !writers.iter().all(|w| w.is_finished()) {
            summary.absorb(&metrics.snapshot());
        }
        for w in writers {
            w.join().unwrap();
        }
        summary.absorb(&metrics.snapshot());

        assert_eq!(summary.sent, THREADS * PER_THREAD);
        assert_eq!(summary.completed, THREADS * PER_THREAD);
    }

    #[test]
    fn latency_merge_combines_worker_histograms() {
        let mut a = Latency::new();
        a.record(Duration::from_millis(1));
        a.record(Duration::from_millis(3));
        let mut b = Latency::new();
        b.record(Duration::from_millis(10));

        a.merge(&b);
        assert_eq!(a.count(), 3);
        assert!(a.max() >= Duration::from_millis(9));
        assert!(a.min() <= Duration::from_millis(1));
    }

    #[test]
    fn success_rate_handles_empty_run() {
        let summary = RunSummary::default();
        assert_eq!(summary.success_rate(), 0.0);

        let summary = RunSummary {
            sent: 10,
            completed: 5,
            ..Default::default()
        };
        assert_eq!(summary.success_rate(), 50.0);
        assert_eq!(summary.failed(), 5);
    }
}
