use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{deadline_after, RestartPolicy, RunConfig, Target};
use crate::connect::dial;
use crate::probe::Prober;
use crate::stats::{Latency, MetricsAggregator};
use crate::worker::{drain, Drained};

/// Lifecycle of one persistent connection.
///
/// `Connecting → Connected → Idle ⇄ AwaitingReply → Closed`, and any live
/// state may drop straight to `Closed`. A supervised restart starts a new
/// lifecycle at `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Connected,
    Idle,
    AwaitingReply,
    Closed,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Idle)
                | (Idle, AwaitingReply)
                | (AwaitingReply, Idle)
                | (Connecting | Connected | Idle | AwaitingReply, Closed)
        )
    }
}

/// Workers that each keep one connection open and probe it on a fixed cadence.
pub struct PersistentPool {
    stop: CancellationToken,
    workers: JoinSet<Latency>,
    size: usize,
}

impl PersistentPool {
    pub fn spawn(config: &RunConfig, metrics: &Arc<MetricsAggregator>) -> Self {
        let stop = CancellationToken::new();
        let size = config.persistent_workers();

        let mut workers = JoinSet::new();
        for id in 0..size {
            let worker = PersistentWorker {
                id,
                target: config.target_for(id),
                cadence: config.cadence,
                probe_timeout: config.probe_timeout,
                restart: config.restart,
                metrics: Arc::clone(metrics),
                stop: stop.clone(),
                state: WorkerState::Connecting,
            };
            workers.spawn(worker.run());
        }

        PersistentPool {
            stop,
            workers,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Signals every worker to stop and waits for them to close.
    pub async fn stop(self, grace: Duration) -> Drained {
        self.stop.cancel();
        drain(self.workers, grace).await
    }
}

enum SessionEnd {
    Stopped,
    Failed { probed: bool },
}

struct PersistentWorker {
    id: usize,
    target: Target,
    cadence: Duration,
    probe_timeout: Duration,
    restart: RestartPolicy,
    metrics: Arc<MetricsAggregator>,
    stop: CancellationToken,
    state: WorkerState,
}

impl PersistentWorker {
    async fn run(mut self) -> Latency {
        let mut latency = Latency::new();
        let mut failures = 0u32;

        loop {
            self.state = WorkerState::Connecting;
            let dialed = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                dialed = dial(&self.target) => Some(dialed),
            };
            let Some(dialed) = dialed else {
                self.transition(WorkerState::Closed);
                break;
            };
            let stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(worker = self.id, "connect failed: {}", e);
                    self.transition(WorkerState::Closed);
                    failures += 1;
                    if self.restart_after(failures).await {
                        continue;
                    }
                    break;
                }
            };

            let open = self.metrics.connection_opened();
            self.transition(WorkerState::Connected);
            let end = self
                .session(Prober::new(stream, self.probe_timeout), &mut latency)
                .await;
            drop(open);
            self.transition(WorkerState::Closed);

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Failed { probed } => {
                    // Restart limits count consecutive failures.
                    failures = if probed { 1 } else { failures + 1 };
                    if !self.restart_after(failures).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "persistent worker exiting");
        latency
    }

    /// Probes on every cadence tick until stopped or until the connection fails.
    async fn session(&mut self, mut prober: Prober, latency: &mut Latency) -> SessionEnd {
        let first = deadline_after(Instant::now(), self.cadence);
        let mut ticker = time::interval_at(first, self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.transition(WorkerState::Idle);
        let mut probed = false;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    prober.stop().await;
                    return SessionEnd::Stopped;
                }
                _ = ticker.tick() => {}
            }

            self.transition(WorkerState::AwaitingReply);
            self.metrics.record_sent();
            let reply = tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                reply = prober.exchange() => Some(reply),
            };
            let Some(reply) = reply else {
                tracing::debug!(worker = self.id, "stopped while awaiting a reply");
                prober.stop().await;
                return SessionEnd::Stopped;
            };
            match reply {
                Ok(rtt) => {
                    self.metrics.record_completed();
                    latency.record(rtt);
                    probed = true;
                    self.transition(WorkerState::Idle);
                }
                Err(e) => {
                    tracing::warn!(worker = self.id, "probe failed, closing connection: {}", e);
                    return SessionEnd::Failed { probed };
                }
            }
        }
    }

    /// Applies the restart policy; `true` means connect again.
    async fn restart_after(&self, failures: u32) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        let Some(delay) = self.restart.delay_for(failures) else {
            tracing::warn!(
                worker = self.id,
                "giving up after {} failure(s), capacity lost for the rest of the run",
                failures
            );
            return false;
        };

        tracing::info!(worker = self.id, attempt = failures, ?delay, "reconnecting");
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(worker = self.id, from = ?self.state, to = ?next, "state");
        self.state = next;
    }
}
