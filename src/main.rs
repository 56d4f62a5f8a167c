use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use pingwrk::config::DEFAULT_PORT;
use pingwrk::{HumanReporter, MetricsAggregator, Responder, RestartPolicy, RunConfig, Strategy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of runtime threads to use
    #[arg(short = 't', long, global = true, default_value_t = num_cpus::get())]
    threads: usize,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive PING probes against a target
    Load(LoadArgs),
    /// Answer PING probes with PONG
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Requests per interval (ephemeral), or connections split evenly over the sources (persistent)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..))]
    rate: u32,

    /// Duration of the test in seconds
    #[arg(short = 'd', long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    duration: u64,

    /// Number of ephemeral workers
    #[arg(short = 'c', long, default_value_t = 64)]
    concurrency: usize,

    /// Connection strategy
    #[arg(short = 's', long, value_enum, default_value_t = StrategyArg::Ephemeral)]
    strategy: StrategyArg,

    /// Job queue capacity
    #[arg(short = 'q', long = "queue", default_value_t = 100)]
    queue_capacity: usize,

    /// Source address to bind, repeat for several identities
    #[arg(short = 'b', long = "source")]
    sources: Vec<IpAddr>,

    /// Dial timeout in seconds
    #[arg(long, default_value_t = 30)]
    dial_timeout: u64,

    /// TCP keep-alive idle time in seconds
    #[arg(long, default_value_t = 30)]
    keepalive: u64,

    /// Deadline for each probe write and read in milliseconds
    #[arg(short = 'T', long = "timeout", default_value_t = 5000)]
    probe_timeout: u64,

    /// Persistent probe cadence in milliseconds
    #[arg(long, default_value_t = 1000)]
    cadence: u64,

    /// Scheduling and reporting interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval: u64,

    /// Time granted to workers after the run before they are aborted, in milliseconds
    #[arg(long, default_value_t = 5000)]
    grace: u64,

    /// Restart policy for persistent workers
    #[arg(long, value_enum, default_value_t = RestartArg::Never)]
    restart: RestartArg,

    /// Restarts allowed per worker (bounded, backoff)
    #[arg(long, default_value_t = 3)]
    max_restarts: u32,

    /// Delay before a restart in milliseconds (initial delay for backoff)
    #[arg(long, default_value_t = 100)]
    restart_delay: u64,

    /// Upper bound of the backoff delay in milliseconds
    #[arg(long, default_value_t = 10_000)]
    max_restart_delay: u64,

    /// Target address
    #[arg(value_name = "ADDRESS", default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    target: SocketAddr,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(short = 'l', long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// How often to log the received PING count, in milliseconds
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Ephemeral,
    Persistent,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RestartArg {
    Never,
    Bounded,
    Backoff,
}

impl LoadArgs {
    fn into_config(self) -> RunConfig {
        let mut config = RunConfig::new(self.target, self.rate);
        config.target.dial_timeout = Duration::from_secs(self.dial_timeout);
        config.target.keepalive = Duration::from_secs(self.keepalive);
        config.duration = Duration::from_secs(self.duration);
        config.concurrency = self.concurrency;
        config.strategy = match self.strategy {
            StrategyArg::Ephemeral => Strategy::Ephemeral,
            StrategyArg::Persistent => Strategy::Persistent,
        };
        config.queue_capacity = self.queue_capacity;
        config.sources = self.sources;
        config.probe_timeout = Duration::from_millis(self.probe_timeout);
        config.cadence = Duration::from_millis(self.cadence);
        config.interval = Duration::from_millis(self.interval);
        config.grace = Duration::from_millis(self.grace);
        config.restart = match self.restart {
            RestartArg::Never => RestartPolicy::Never,
            RestartArg::Bounded => RestartPolicy::Bounded {
                max_restarts: self.max_restarts,
                delay: Duration::from_millis(self.restart_delay),
            },
            RestartArg::Backoff => RestartPolicy::Backoff {
                initial: Duration::from_millis(self.restart_delay),
                max: Duration::from_millis(self.max_restart_delay),
                max_restarts: Some(self.max_restarts),
            },
        };
        config
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let directive = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(directive.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {}", e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.threads.max(1))
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Load(args) => load(args).await,
            Command::Serve(args) => serve(args).await,
        }
    })
}

async fn load(args: LoadArgs) -> Result<()> {
    let config = args.into_config();
    config.validate().context("invalid run configuration")?;

    println!(
        "Running {:?} {:?} test @ {}",
        config.duration, config.strategy, config.target.addr
    );
    match config.strategy {
        Strategy::Ephemeral => println!(
            "  {} requests per {:?}, {} workers, queue of {}",
            config.rate, config.interval, config.concurrency, config.queue_capacity
        ),
        Strategy::Persistent => println!(
            "  {} connections over {} source(s), probing every {:?}",
            config.persistent_workers(),
            config.identities(),
            config.cadence
        ),
    }
    println!();

    let metrics = Arc::new(MetricsAggregator::new());
    pingwrk::run(&config, metrics, &mut HumanReporter).await?;
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let responder = Responder::bind(args.listen)
        .await
        .with_context(|| format!("listen on {}", args.listen))?
        .with_report_interval(Duration::from_millis(args.interval));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupted, shutting down");
                    shutdown.cancel();
                }
                Err(e) => tracing::warn!("cannot listen for ctrl-c: {}", e),
            }
        });
    }

    responder.serve(shutdown).await;
    Ok(())
}
