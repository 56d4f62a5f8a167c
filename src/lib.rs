//! Rate-controlled TCP probe load generator.
//!
//! A run drives PING/PONG probes against a target either with one connection
//! per job ([`Strategy::Ephemeral`]) or with long-lived connections probed on a
//! cadence ([`Strategy::Persistent`]). Counters live in a [`MetricsAggregator`]
//! owned by the run and are reported and reset every interval.

pub mod config;
pub mod connect;
pub mod persistent;
pub mod probe;
pub mod report;
pub mod responder;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use config::{ConfigError, RestartPolicy, RunConfig, Strategy, Target};
pub use report::{HumanReporter, Reporter};
pub use responder::Responder;
pub use scheduler::run;
pub use stats::{MetricsAggregator, MetricsSnapshot, RunSummary};
