use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::time::Instant;

/// Port the responder listens on by default.
pub const DEFAULT_PORT: u16 = 2002;

/// Roughly 30 years, what tokio substitutes for an unrepresentable deadline.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + period`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(from: Instant, period: Duration) -> Instant {
    from.checked_add(period)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Where and how to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub addr: SocketAddr,
    /// Local address to bind before connecting, port chosen by the OS.
    pub bind: Option<IpAddr>,
    pub dial_timeout: Duration,
    pub keepalive: Duration,
}

impl Target {
    pub fn new(addr: SocketAddr) -> Self {
        Target {
            addr,
            bind: None,
            dial_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }

    pub fn bound_to(self, bind: Option<IpAddr>) -> Self {
        Target { bind, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// One connection per job.
    #[default]
    Ephemeral,
    /// One long-lived connection per worker.
    Persistent,
}

/// What a persistent worker does after losing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// The worker exits and its capacity is gone for the rest of the run.
    #[default]
    Never,
    /// Reconnect after a fixed delay, at most `max_restarts` times.
    Bounded { max_restarts: u32, delay: Duration },
    /// Reconnect with a doubling delay capped at `max`.
    /// `None` retries until the run stops.
    Backoff {
        initial: Duration,
        max: Duration,
        max_restarts: Option<u32>,
    },
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (starting at 1), or `None` when
    /// the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::Bounded {
                max_restarts,
                delay,
            } => (attempt <= max_restarts).then_some(delay),
            RestartPolicy::Backoff {
                initial,
                max,
                max_restarts,
            } => {
                if max_restarts.is_some_and(|m| attempt > m) {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Everything a run needs, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: Target,
    /// Jobs per interval (ephemeral). Persistent runs divide it by the number
    /// of identities to get the total worker count, see [`RunConfig::persistent_workers`].
    pub rate: u32,
    pub duration: Duration,
    /// Ephemeral worker count.
    pub concurrency: usize,
    pub strategy: Strategy,
    /// Scheduling tick and reporting period.
    pub interval: Duration,
    pub queue_capacity: usize,
    /// Deadline applied to every probe write and read.
    pub probe_timeout: Duration,
    /// Persistent probe period.
    pub cadence: Duration,
    /// Source addresses; each one is an identity.
    pub sources: Vec<IpAddr>,
    pub restart: RestartPolicy,
    /// How long to wait for workers after stop before aborting them.
    pub grace: Duration,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rate must be greater than zero")]
    ZeroRate,
    #[error("concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("duration must be greater than zero")]
    ZeroDuration,
    #[error("queue capacity must be greater than zero")]
    ZeroQueue,
    #[error("{name} must be greater than zero")]
    ZeroPeriod { name: &'static str },
    #[error("source {source_ip} cannot reach {target} (address family mismatch)")]
    SourceFamily { source_ip: IpAddr, target: SocketAddr },
}

impl RunConfig {
    pub fn new(target: SocketAddr, rate: u32) -> Self {
        RunConfig {
            target: Target::new(target),
            rate,
            duration: Duration::from_secs(15),
            concurrency: 64,
            strategy: Strategy::Ephemeral,
            interval: Duration::from_secs(1),
            queue_capacity: 100,
            probe_timeout: Duration::from_secs(5),
            cadence: Duration::from_secs(1),
            sources: Vec::new(),
            restart: RestartPolicy::Never,
            grace: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        for (name, period) in [
            ("interval", self.interval),
            ("cadence", self.cadence),
            ("probe timeout", self.probe_timeout),
            ("dial timeout", self.target.dial_timeout),
        ] {
            if period.is_zero() {
                return Err(ConfigError::ZeroPeriod { name });
            }
        }
        if let Some(source) = self
            .sources
            .iter()
            .find(|ip| ip.is_ipv4() != self.target.addr.is_ipv4())
        {
            return Err(ConfigError::SourceFamily {
                source_ip: *source,
                target: self.target.addr,
            });
        }
        Ok(())
    }

    /// Number of distinct source identities, at least one.
    pub fn identities(&self) -> usize {
        self.sources.len().max(1)
    }

    /// Worker count for the persistent strategy.
    pub fn persistent_workers(&self) -> usize {
        (self.rate as usize / self.identities()).max(1)
    }

    /// Target for worker `index`, bound round-robin over the sources.
    pub fn target_for(&self, index: usize) -> Target {
        let bind = match self.sources.len() {
            0 => None,
            n => Some(self.sources[index % n]),
        };
        self.target.bound_to(bind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::new("127.0.0.1:2002".parse().unwrap(), 10)
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn rejects_non_positive_values() {
        let mut c = config();
        c.rate = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroRate));

        let mut c = config();
        c.concurrency = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroConcurrency));

        let mut c = config();
        c.duration = Duration::ZERO;
        assert_eq!(c.validate(), Err(ConfigError::ZeroDuration));

        let mut c = config();
        c.cadence = Duration::ZERO;
        assert_eq!(
            c.validate(),
            Err(ConfigError::ZeroPeriod { name: "cadence" })
        );
    }

    #[test]
    fn rejects_source_of_other_family() {
        let mut c = config();
        c.sources = vec!["::1".parse().unwrap()];
        assert!(matches!(
            c.validate(),
            Err(ConfigError::SourceFamily { .. })
        ));
    }

    #[test]
    fn persistent_workers_split_rate_over_identities() {
        let mut c = config();
        c.rate = 6;
        c.sources = vec!["127.0.0.1".parse().unwrap(), "127.0.0.2".parse().unwrap()];
        assert_eq!(c.persistent_workers(), 3);

        c.rate = 1;
        assert_eq!(c.persistent_workers(), 1);

        c.sources.clear();
        c.rate = 7;
        assert_eq!(c.persistent_workers(), 7);
    }

    #[test]
    fn targets_are_bound_round_robin() {
        let mut c = config();
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        c.sources = vec![a, b];
        assert_eq!(c.target_for(0).bind, Some(a));
        assert_eq!(c.target_for(1).bind, Some(b));
        assert_eq!(c.target_for(2).bind, Some(a));
        assert_eq!(config().target_for(5).bind, None);
    }

    #[test]
    fn huge_periods_clamp_instead_of_overflowing() {
        let now = Instant::now();
        let far = deadline_after(now, Duration::MAX);
        assert!(far > now + Duration::from_secs(86400 * 365));
        assert_eq!(
            deadline_after(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
    }

    #[test]
    fn restart_policies() {
        assert_eq!(RestartPolicy::Never.delay_for(1), None);

        let bounded = RestartPolicy::Bounded {
            max_restarts: 2,
            delay: Duration::from_millis(50),
        };
        assert_eq!(bounded.delay_for(1), Some(Duration::from_millis(50)));
        assert_eq!(bounded.delay_for(2), Some(Duration::from_millis(50)));
        assert_eq!(bounded.delay_for(3), None);

        let backoff = RestartPolicy::Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_restarts: None,
        };
        assert_eq!(backoff.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(backoff.delay_for(4), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay_for(40), Some(Duration::from_millis(500)));
    }
}
