use std::sync::Arc;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{deadline_after, ConfigError, RunConfig, Strategy};
use crate::persistent::PersistentPool;
use crate::report::{Reporter, ReportingLoop};
use crate::stats::{MetricsAggregator, RunSummary};
use crate::worker::{Drained, EphemeralPool, Job};

/// Runs one load test to completion.
///
/// `metrics` belongs to this run; pass a fresh aggregator per run. The
/// returned summary is the sum of every snapshot handed to `reporter`, taken
/// after all workers have stopped.
pub async fn run(
    config: &RunConfig,
    metrics: Arc<MetricsAggregator>,
    reporter: &mut dyn Reporter,
) -> Result<RunSummary, ConfigError> {
    config.validate()?;

    tracing::info!(
        addr = %config.target.addr,
        rate = config.rate,
        duration = ?config.duration,
        strategy = ?config.strategy,
        "starting run"
    );

    let done = CancellationToken::new();
    let drive = async {
        let drained = match config.strategy {
            Strategy::Ephemeral => drive_ephemeral(config, &metrics).await,
            Strategy::Persistent => drive_persistent(config, &metrics).await,
        };
        done.cancel();
        drained
    };
    let reporting = ReportingLoop::new(Arc::clone(&metrics), config.interval, reporter);

    let (drained, mut summary) = tokio::join!(drive, reporting.run(done.clone()));
    summary.latency = drained.latency;
    summary.aborted_workers = drained.aborted;
    summary.abandoned_jobs = drained.abandoned;
    reporter.finish(&summary);

    Ok(summary)
}

/// Submits `rate` jobs at the start of every interval until the run is over.
async fn drive_ephemeral(config: &RunConfig, metrics: &Arc<MetricsAggregator>) -> Drained {
    let pool = EphemeralPool::spawn(config, metrics);
    let deadline = deadline_after(Instant::now(), config.duration);
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_id = 0u64;

    'run: loop {
        tokio::select! {
            biased;
            _ = time::sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }

        for _ in 0..config.rate {
            let job = Job { id: next_id };
            match time::timeout_at(deadline, pool.submit(job)).await {
                Ok(Ok(())) => next_id += 1,
                Ok(Err(e)) => {
                    tracing::error!("{}", e);
                    break 'run;
                }
                Err(_) => {
                    tracing::warn!(
                        job = next_id,
                        "job queue still full when the run ended, dropping the rest of this tick"
                    );
                    break 'run;
                }
            }
        }
    }

    tracing::info!(jobs = next_id, "run duration elapsed, closing job queue");
    pool.close(config.grace).await
}

/// Starts the persistent workers once and stops them when the run is over.
async fn drive_persistent(config: &RunConfig, metrics: &Arc<MetricsAggregator>) -> Drained {
    let pool = PersistentPool::spawn(config, metrics);
    tracing::info!(
        workers = pool.len(),
        identities = config.identities(),
        "persistent workers started"
    );

    time::sleep(config.duration).await;

    tracing::info!("run duration elapsed, stopping persistent workers");
    pool.stop(config.grace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::HumanReporter;
    use crate::responder::Responder;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_config_is_rejected_before_start() {
        let mut config = RunConfig::new("127.0.0.1:9".parse().unwrap(), 1);
        config.rate = 0;

        let metrics = Arc::new(MetricsAggregator::new());
        let err = run(&config, Arc::clone(&metrics), &mut HumanReporter)
            .await
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroRate);
        assert_eq!(metrics.snapshot().sent, 0);
    }

    #[tokio::test]
    async fn submits_rate_jobs_per_interval() {
        let responder = Responder::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut config = RunConfig::new(responder.local_addr(), 5);
        config.interval = Duration::from_millis(200);
        config.duration = Duration::from_millis(600);
        config.concurrency = 2;

        let summary = run(&config, Arc::new(MetricsAggregator::new()), &mut HumanReporter)
            .await
            .unwrap();

        assert_eq!(summary.sent, 15);
        assert_eq!(summary.completed, 15);
        assert_eq!(summary.open_connections, 0);
        assert_eq!(responder.pings_total(), 15);
    }

    #[tokio::test]
    async fn unbounded_periods_do_not_overflow() {
        let responder = Responder::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut config = RunConfig::new(responder.local_addr(), 3);
        config.interval = Duration::MAX;
        config.grace = Duration::MAX;
        config.duration = Duration::from_millis(200);

        let summary = run(&config, Arc::new(MetricsAggregator::new()), &mut HumanReporter)
            .await
            .unwrap();
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.completed, 3);

        config.strategy = Strategy::Persistent;
        config.cadence = Duration::MAX;
        let summary = run(&config, Arc::new(MetricsAggregator::new()), &mut HumanReporter)
            .await
            .unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.open_connections, 0);
    }
}
