use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time;

use crate::config::{deadline_after, RunConfig, Target};
use crate::connect::{dial, DialError};
use crate::probe::{ProbeError, Prober};
use crate::stats::{Latency, MetricsAggregator};

/// One unit of ephemeral work, identified by its submission sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Returned by [`EphemeralPool::submit`] once the queue is closed.
#[derive(Debug, thiserror::Error)]
#[error("job queue closed, job {} not accepted", .0.id)]
pub struct QueueClosed(pub Job);

/// What the workers handed back when they stopped.
#[derive(Debug, Default)]
pub struct Drained {
    pub latency: Latency,
    pub aborted: usize,
    /// Jobs left in the queue by aborted workers, counted as sent.
    pub abandoned: u64,
}

/// Waits for every worker; the ones still running after `grace` are aborted.
pub(crate) async fn drain(mut workers: JoinSet<Latency>, grace: Duration) -> Drained {
    let deadline = deadline_after(time::Instant::now(), grace);
    let mut drained = Drained::default();

    loop {
        match time::timeout_at(deadline, workers.join_next()).await {
            Ok(Some(Ok(latency))) => drained.latency.merge(&latency),
            Ok(Some(Err(e))) => tracing::error!("worker task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    remaining = workers.len(),
                    "workers did not stop within {:?}, aborting",
                    grace
                );
                workers.abort_all();
                while let Some(res) = workers.join_next().await {
                    match res {
                        Ok(latency) => drained.latency.merge(&latency),
                        Err(e) if e.is_cancelled() => drained.aborted += 1,
                        Err(e) => tracing::error!("worker task failed: {}", e),
                    }
                }
                break;
            }
        }
    }

    drained
}

/// Fixed set of workers draining a bounded job queue, one connection per job.
pub struct EphemeralPool {
    queue: mpsc::Sender<Job>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    metrics: Arc<MetricsAggregator>,
    workers: JoinSet<Latency>,
}

impl EphemeralPool {
    pub fn spawn(config: &RunConfig, metrics: &Arc<MetricsAggregator>) -> Self {
        let (queue, jobs) = mpsc::channel(config.queue_capacity);
        let jobs = Arc::new(Mutex::new(jobs));

        let mut workers = JoinSet::new();
        for id in 0..config.concurrency {
            let worker = Worker {
                id,
                target: config.target_for(id),
                probe_timeout: config.probe_timeout,
                metrics: Arc::clone(metrics),
                jobs: Arc::clone(&jobs),
            };
            workers.spawn(worker.run());
        }

        EphemeralPool {
            queue,
            jobs,
            metrics: Arc::clone(metrics),
            workers,
        }
    }

    /// Queues a job, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), QueueClosed> {
        self.queue.send(job).await.map_err(|e| QueueClosed(e.0))
    }

    /// Closes the queue, lets the workers finish what is queued and waits for them.
    ///
    /// Jobs still queued once the grace period has aborted the workers are
    /// counted as sent and never completed.
    pub async fn close(self, grace: Duration) -> Drained {
        let EphemeralPool {
            queue,
            jobs,
            metrics,
            workers,
        } = self;
        drop(queue);
        let mut drained = drain(workers, grace).await;

        let mut queued = jobs.lock().await;
        queued.close();
        while let Ok(job) = queued.try_recv() {
            tracing::trace!(job = job.id, "abandoned in queue");
            metrics.record_sent();
            drained.abandoned += 1;
        }
        if drained.abandoned > 0 {
            tracing::warn!(
                abandoned = drained.abandoned,
                "jobs left in the queue after workers were aborted"
            );
        }
        drained
    }
}

struct Worker {
    id: usize,
    target: Target,
    probe_timeout: Duration,
    metrics: Arc<MetricsAggregator>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl Worker {
    async fn run(self) -> Latency {
        let mut latency = Latency::new();

        loop {
            let job = {
                let mut jobs = self.jobs.lock().await;
                jobs.recv().await
            };
            let Some(job) = job else {
                break;
            };

            // Counted before the dial: a failed dial is a sent but not completed job.
            self.metrics.record_sent();
            match self.handle().await {
                Ok(rtt) => latency.record(rtt),
                Err(e) => {
                    tracing::debug!(worker = self.id, job = job.id, "job abandoned: {}", e);
                }
            }
        }

        tracing::debug!(worker = self.id, "job queue closed, worker exiting");
        latency
    }

    async fn handle(&self) -> Result<Duration, JobError> {
        let stream = dial(&self.target).await?;
        let _open = self.metrics.connection_opened();
        let mut prober = Prober::new(stream, self.probe_timeout);

        let rtt = prober.exchange().await?;
        self.metrics.record_completed();
        Ok(rtt)
    }
}
