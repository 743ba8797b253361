//! synd-worker - Background daemon running the pipeline worker pools
//!
//! Drains the publish, metrics and inbox-poll queues and, optionally,
//! schedules the periodic metrics and inbox rounds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use libsyndicast::config::Config;
use libsyndicast::handlers::publish_deadline;
use libsyndicast::jobs::{QueueName, WorkerOptions};
use libsyndicast::logging::{LogFormat, LoggingConfig};
use libsyndicast::rate_limiter::RateLimiters;
use libsyndicast::realtime::{EventBus, EventReceiver};
use libsyndicast::scheduler::Scheduler;
use libsyndicast::{
    AdapterRegistry, CredentialVault, Database, PipelineHandler, Queues, SyndicastError,
    WorkerContext, WorkerPool,
};
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

/// How often expired rate-limit windows are purged
const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "synd-worker")]
#[command(version)]
#[command(about = "Background daemon running the publish, metrics and inbox-poll workers")]
#[command(long_about = "\
synd-worker - Background daemon running the pipeline workers

DESCRIPTION:
    synd-worker is a long-running daemon that claims jobs from the
    Syndicast queues and runs them: publishing post items to their
    platforms, refreshing engagement metrics and polling inboxes.

    Each queue gets its own worker pool with the concurrency configured
    under [queues.<name>]. Failed jobs are retried with exponential
    backoff until their attempt budget runs out.

USAGE:
    # Run every queue plus the metrics/inbox scheduler
    synd-worker

    # Only publish jobs, no scheduler
    synd-worker --queues publish --no-schedule

    # JSON logs for a log collector
    synd-worker --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (stops claiming, finishes in-flight jobs)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    Database location: ~/.local/share/syndicast/syndicast.db

    Override with environment variables:
        SYNDICAST_CONFIG      - Path to config file
        SYNDICAST_DB_PATH     - Path to database file
        SYNDICAST_MASTER_KEY  - Credential vault master key
        SYNDICAST_LOG_FORMAT  - text, json or pretty
        SYNDICAST_LOG_LEVEL   - Default log filter

    [queues.publish]
    concurrency = 5     # jobs in flight
    attempts = 3        # attempts before a job fails for good
    backoff_ms = 5000   # first retry delay, doubled per attempt

    [scheduler]
    metrics_interval_secs = 3600
    inbox_interval_secs = 300

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or credential error
")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Queues to run, comma separated (default: all)
    #[arg(long, value_delimiter = ',', value_name = "QUEUES")]
    #[arg(help = "Queues to run: publish, metrics, inbox-poll (default: all)")]
    queues: Vec<QueueName>,

    /// Do not schedule metrics and inbox rounds
    #[arg(long)]
    no_schedule: bool,

    /// Log output format
    #[arg(long, value_name = "FORMAT")]
    #[arg(help = "Log format: text, json or pretty")]
    log_format: Option<LogFormat>,

    /// Default log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Drain runnable jobs once and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

impl Cli {
    fn logging(&self) -> LoggingConfig {
        let env = LoggingConfig::from_env();
        LoggingConfig::new(
            self.log_format.unwrap_or(env.format),
            self.log_level.clone().unwrap_or(env.level),
            self.verbose,
        )
    }

    fn selected_queues(&self) -> Vec<QueueName> {
        if self.queues.is_empty() {
            return QueueName::ALL.to_vec();
        }
        let mut selected = Vec::new();
        for name in &self.queues {
            if !selected.contains(name) {
                selected.push(*name);
            }
        }
        selected
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.logging().init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "synd-worker failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Library errors keep their own exit code; anything else is a runtime error
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<SyndicastError>()
        .map_or(1, SyndicastError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    let db_path = config.database_path();
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path))?;
    let vault = Arc::new(CredentialVault::from_config(&config.vault)?);
    let adapters = AdapterRegistry::from_config(&config.platforms)?;
    let limiters = RateLimiters::from_config(&config.rate_limits, &db)?;

    let events = EventBus::default();
    tokio::spawn(log_events(events.subscribe()));

    let ctx = Arc::new(
        WorkerContext::new(
            db.clone(),
            vault,
            adapters.clone(),
            limiters.clone(),
            Arc::new(events),
        )
        .with_metrics_batch_size(config.metrics.batch_size)
        .with_publish_timeout(publish_deadline(config.queues.publish.job_timeout())),
    );
    let handler = Arc::new(PipelineHandler::new(ctx));
    let queues = Queues::sqlite(&db, &config.queues);

    let pools: Vec<WorkerPool> = cli
        .selected_queues()
        .into_iter()
        .map(|name| {
            WorkerPool::new(
                Arc::clone(queues.get(name)),
                handler.clone(),
                WorkerOptions::from(config.queues.for_queue(name)),
            )
        })
        .collect();

    info!(
        queues = ?cli.selected_queues(),
        implemented = ?adapters.implemented(),
        "synd-worker starting"
    );

    if cli.once {
        futures::future::try_join_all(pools.iter().map(|pool| pool.drain())).await?;
        for pool in &pools {
            info!(queue = %pool.queue().name(), stats = ?pool.stats(), "Drained queue");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    setup_signal_handlers(shutdown_tx)?;

    tokio::spawn(purge_counters(limiters, shutdown_rx.clone()));

    let scheduler = (!cli.no_schedule)
        .then(|| Scheduler::new(db, queues.clone(), adapters, config.scheduler.clone()));
    let schedule = async {
        match &scheduler {
            Some(scheduler) => scheduler.run(shutdown_rx.clone()).await,
            None => Ok(()),
        }
    };
    let workers = futures::future::try_join_all(pools.iter().map(|pool| pool.run(shutdown_rx.clone())));

    tokio::try_join!(workers, schedule)?;

    info!("synd-worker stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

/// Mirror realtime events into the debug log
async fn log_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::debug!(
                channel = %event.channel,
                event_type = %event.envelope.event_type,
                "Realtime event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn purge_counters(limiters: RateLimiters, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(COUNTER_PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => match limiters.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged expired rate limit windows"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge rate limit windows"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queues_default_to_all() {
        let cli = Cli::parse_from(["synd-worker"]);
        assert_eq!(cli.selected_queues(), QueueName::ALL.to_vec());
        assert!(!cli.no_schedule);
    }

    #[test]
    fn test_queue_list_is_parsed_and_deduplicated() {
        let cli = Cli::parse_from(["synd-worker", "--queues", "publish,inbox,publish"]);
        assert_eq!(
            cli.selected_queues(),
            vec![QueueName::Publish, QueueName::InboxPoll]
        );
    }

    #[test]
    fn test_exit_code_follows_library_error() {
        let config_error: anyhow::Error =
            SyndicastError::from(libsyndicast::error::VaultError::MissingMasterKey).into();
        assert_eq!(exit_code(&config_error), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_unknown_queue_is_rejected() {
        assert!(Cli::try_parse_from(["synd-worker", "--queues", "email"]).is_err());
    }

    #[test]
    fn test_log_flags_override_environment() {
        let cli = Cli::parse_from([
            "synd-worker",
            "--log-format",
            "json",
            "--log-level",
            "warn",
        ]);
        let logging = cli.logging();
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(logging.level, "warn");
        assert!(!logging.verbose);
    }
}
