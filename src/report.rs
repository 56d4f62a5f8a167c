use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::deadline_after;
use crate::stats::{MetricsAggregator, MetricsSnapshot, RunSummary};

/// Consumer of the periodic snapshots and of the final summary.
pub trait Reporter: Send {
    fn on_snapshot(&mut self, elapsed: Duration, snapshot: &MetricsSnapshot);
    fn finish(&mut self, summary: &RunSummary);
}

/// Writes one line per interval and a closing summary to stdout.
#[derive(Debug, Default)]
pub struct HumanReporter;

impl Reporter for HumanReporter {
    fn on_snapshot(&mut self, elapsed: Duration, snapshot: &MetricsSnapshot) {
        println!(
            "[{:>7.2}s] sent: {:>6}  completed: {:>6}  open connections: {:>6}",
            elapsed.as_secs_f64(),
            snapshot.sent,
            snapshot.completed,
            snapshot.open_connections
        );
    }

    fn finish(&mut self, summary: &RunSummary) {
        let secs = summary.elapsed.as_secs_f64().max(f64::EPSILON);

        println!("\nSummary:");
        println!("Total Requests: {}", summary.sent);
        println!("Completed Requests: {}", summary.completed);
        println!("Failed Requests: {}", summary.failed());
        println!("Success Rate: {:.2}%", summary.success_rate());
        println!("Requests/sec: {:.2}", summary.completed as f64 / secs);
        if summary.aborted_workers > 0 {
            println!("Aborted Workers: {}", summary.aborted_workers);
        }
        if summary.abandoned_jobs > 0 {
            println!("Abandoned Jobs: {}", summary.abandoned_jobs);
        }

        let latency = &summary.latency;
        if latency.count() > 0 {
            println!("\nLatency:");
            println!("  Avg: {:.2}ms", latency.mean().as_secs_f64() * 1000.0);
            println!("  Min: {:.2}ms", latency.min().as_secs_f64() * 1000.0);
            println!("  Max: {:.2}ms", latency.max().as_secs_f64() * 1000.0);
            println!("  P99: {:.2}ms", latency.quantile(0.99).as_secs_f64() * 1000.0);
        }
    }
}

/// Pulls a snapshot every interval and hands it to a [`Reporter`].
pub struct ReportingLoop<'a> {
    metrics: Arc<MetricsAggregator>,
    interval: Duration,
    reporter: &'a mut dyn Reporter,
}

impl<'a> ReportingLoop<'a> {
    pub fn new(
        metrics: Arc<MetricsAggregator>,
        interval: Duration,
        reporter: &'a mut dyn Reporter,
    ) -> Self {
        ReportingLoop {
            metrics,
            interval,
            reporter,
        }
    }

    /// Reports until `done` is cancelled, then reports once more so that the
    /// returned totals cover every increment made before `done`.
    pub async fn run(self, done: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let first = deadline_after(started, self.interval);
        let mut ticker = time::interval_at(first, self.interval);
        let mut summary = RunSummary::default();

        loop {
            let last = tokio::select! {
                biased;
                _ = done.cancelled() => true,
                _ = ticker.tick() => false,
            };

            let snapshot = self.metrics.snapshot();
            summary.absorb(&snapshot);
            self.reporter.on_snapshot(started.elapsed(), &snapshot);

            if last {
                break;
            }
        }

        summary.elapsed = started.elapsed();
        summary
    }
}
