//! synd-queue - Enqueue and inspect pipeline jobs
//!
//! Unix-style tool for feeding the Syndicast queues and looking at what the
//! workers are doing. Results go to stdout, logs to stderr.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};
use libsyndicast::config::Config;
use libsyndicast::handlers::send_reply;
use libsyndicast::jobs::{InboxPollJob, Job, JobState, MetricsJob, PublishJob};
use libsyndicast::logging::{LogFormat, LoggingConfig};
use libsyndicast::rate_limiter::RateLimiters;
use libsyndicast::realtime::NoopNotifier;
use libsyndicast::{
    AdapterRegistry, CredentialVault, Database, JobPayload, PostItemStatus, QueueName, Queues,
    SyndicastError, WorkerContext,
};

#[derive(Parser, Debug)]
#[command(name = "synd-queue")]
#[command(version)]
#[command(about = "Enqueue and inspect pipeline jobs")]
#[command(long_about = "\
synd-queue - Enqueue and inspect pipeline jobs

DESCRIPTION:
    synd-queue is a Unix-style tool for the Syndicast job queues. Use it to
    enqueue publish, metrics and inbox-poll jobs, watch queue statistics,
    re-enqueue failed jobs and seal platform tokens into credential blobs.
    Jobs are picked up by a running synd-worker.

COMMANDS:
    publish     Enqueue publish jobs for every unpublished item of a post
    metrics     Enqueue a metrics refresh for one item or one account
    inbox       Enqueue an inbox poll for an account
    reply       Send a reply on a conversation right away
    stats       Show job counts per queue
    list        List recent jobs of a queue
    retry       Move failed jobs back to waiting
    seal-token  Encrypt an access token for storage

USAGE EXAMPLES:
    # Publish a post in ten minutes
    synd-queue publish <POST_ID> --delay 10m

    # Refresh the metrics of one item
    synd-queue metrics --item <POST_ITEM_ID>

    # Failed publish jobs as JSON
    synd-queue list publish --state failed --format json

    # Seal a token read from a pipe
    echo \"$TOKEN\" | synd-queue seal-token --stdin

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    Database location: ~/.local/share/syndicast/syndicast.db

    Override with environment variables:
        SYNDICAST_CONFIG      - Path to config file
        SYNDICAST_DB_PATH     - Path to database file
        SYNDICAST_MASTER_KEY  - Credential vault master key

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Configuration or credential error
    3 - Invalid input (unknown post, bad duration, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue publish jobs for a post
    Publish {
        /// Post ID
        post_id: String,

        /// Delay before the jobs become runnable (e.g. "30s", "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        delay: Option<Duration>,
    },

    /// Enqueue a metrics refresh
    #[command(group(ArgGroup::new("target").required(true).args(["item", "account"])))]
    Metrics {
        /// Refresh a single published item
        #[arg(long, value_name = "POST_ITEM_ID")]
        item: Option<String>,

        /// Refresh the recent items of an account
        #[arg(long, value_name = "ACCOUNT_ID")]
        account: Option<String>,
    },

    /// Enqueue an inbox poll
    Inbox {
        /// Social account ID
        account_id: String,
    },

    /// Reply on a conversation
    Reply {
        /// Conversation ID
        conversation_id: String,

        /// Reply text
        content: String,
    },

    /// Show job counts per queue
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List recent jobs
    List {
        /// Queue name: publish, metrics or inbox-poll
        queue: QueueName,

        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Maximum number of jobs
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Move failed jobs back to waiting with a fresh attempt budget
    Retry {
        /// Queue name (default: every queue)
        queue: Option<QueueName>,
    },

    /// Encrypt an access token into a credential blob
    SealToken {
        /// Read the token from stdin instead of prompting
        #[arg(long)]
        stdin: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        tracing::debug!(error = ?e, "synd-queue failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

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

    if let Commands::SealToken { stdin } = cli.command {
        return cmd_seal_token(&config, stdin);
    }

    let db_path = config.database_path();
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path))?;
    let queues = Queues::sqlite(&db, &config.queues);

    match cli.command {
        Commands::Publish { post_id, delay } => cmd_publish(&db, &queues, &post_id, delay).await,
        Commands::Metrics { item, account } => cmd_metrics(&db, &queues, item, account).await,
        Commands::Inbox { account_id } => cmd_inbox(&db, &queues, &account_id).await,
        Commands::Reply {
            conversation_id,
            content,
        } => cmd_reply(&config, db, &conversation_id, &content).await,
        Commands::Stats { format } => cmd_stats(&queues, format).await,
        Commands::List {
            queue,
            state,
            limit,
            format,
        } => cmd_list(&queues, queue, state, limit, format).await,
        Commands::Retry { queue } => cmd_retry(&queues, queue).await,
        Commands::SealToken { .. } => Ok(()),
    }
}

/// Enqueue one publish job per item that is not yet published
async fn cmd_publish(
    db: &Database,
    queues: &Queues,
    post_id: &str,
    delay: Option<Duration>,
) -> anyhow::Result<()> {
    let post = db
        .get_post(post_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("post", post_id))?;
    let items = db.list_post_items(&post.id).await?;

    let mut enqueued = 0;
    for item in items.iter().filter(|i| i.status != PostItemStatus::Published) {
        let payload: JobPayload = PublishJob {
            post_item_id: item.id.clone(),
            brand_id: post.brand_id.clone(),
        }
        .into();
        let job = match delay {
            Some(delay) => queues.publish.enqueue_delayed(payload, delay).await?,
            None => queues.publish.enqueue(payload).await?,
        };
        tracing::debug!(job_id = %job.id, post_item_id = %item.id, "Enqueued publish job");
        println!("{}\t{}\t{}", job.id, item.platform, item.id);
        enqueued += 1;
    }

    if enqueued == 0 {
        eprintln!("Nothing to publish: every item of post {} is published", post.id);
    }
    Ok(())
}

async fn cmd_metrics(
    db: &Database,
    queues: &Queues,
    item: Option<String>,
    account: Option<String>,
) -> anyhow::Result<()> {
    let job = match (item, account) {
        (Some(item_id), _) => {
            let entry = db
                .get_post_item(&item_id)
                .await?
                .ok_or_else(|| SyndicastError::not_found("post item", &item_id))?;
            let post = db
                .get_post(&entry.post_id)
                .await?
                .ok_or_else(|| SyndicastError::not_found("post", &entry.post_id))?;
            MetricsJob::for_item(entry.id, post.brand_id)
        }
        (None, Some(account_id)) => {
            let account = db
                .get_account(&account_id)
                .await?
                .ok_or_else(|| SyndicastError::not_found("social account", &account_id))?;
            MetricsJob::for_account(account.id, account.brand_id)
        }
        (None, None) => bail!(SyndicastError::InvalidInput(
            "pass --item or --account".to_string()
        )),
    };

    let job = queues.metrics.enqueue(job.into()).await?;
    println!("{}", job.id);
    Ok(())
}

async fn cmd_inbox(db: &Database, queues: &Queues, account_id: &str) -> anyhow::Result<()> {
    let account = db
        .get_account(account_id)
        .await?
        .ok_or_else(|| SyndicastError::not_found("social account", account_id))?;

    let job = queues
        .inbox_poll
        .enqueue(
            InboxPollJob {
                social_account_id: account.id,
                brand_id: account.brand_id,
                platform: account.platform,
            }
            .into(),
        )
        .await?;
    println!("{}", job.id);
    Ok(())
}

async fn cmd_reply(
    config: &Config,
    db: Database,
    conversation_id: &str,
    content: &str,
) -> anyhow::Result<()> {
    let limiters = RateLimiters::from_config(&config.rate_limits, &db)?;
    let ctx = WorkerContext::new(
        db,
        Arc::new(CredentialVault::from_config(&config.vault)?),
        AdapterRegistry::from_config(&config.platforms)?,
        limiters,
        Arc::new(NoopNotifier),
    );

    let message = send_reply(&ctx, conversation_id, content).await?;
    println!("{}", message.id);
    Ok(())
}

async fn cmd_stats(queues: &Queues, format: OutputFormat) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for name in QueueName::ALL {
        rows.push((name, queues.get(name).stats().await?));
    }

    match format {
        OutputFormat::Json => {
            let json: serde_json::Map<String, serde_json::Value> = rows
                .iter()
                .map(|(name, stats)| Ok((name.to_string(), serde_json::to_value(stats)?)))
                .collect::<serde_json::Result<_>>()?;
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!(
                "{:<12} {:>8} {:>8} {:>8} {:>10} {:>8}",
                "QUEUE", "WAITING", "DELAYED", "ACTIVE", "COMPLETED", "FAILED"
            );
            for (name, stats) in &rows {
                println!(
                    "{:<12} {:>8} {:>8} {:>8} {:>10} {:>8}",
                    name.as_str(),
                    stats.waiting,
                    stats.delayed,
                    stats.active,
                    stats.completed,
                    stats.failed
                );
            }
        }
    }
    Ok(())
}

async fn cmd_list(
    queues: &Queues,
    queue: QueueName,
    state: Option<JobState>,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let jobs = queues.get(queue).list(state, limit).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Text => {
            for job in &jobs {
                println!("{}", format_job_line(job));
            }
        }
    }
    Ok(())
}

fn format_job_line(job: &Job) -> String {
    let target = match &job.payload {
        JobPayload::Publish(p) => p.post_item_id.clone(),
        JobPayload::Metrics(m) => m
            .post_item_id
            .clone()
            .or_else(|| m.social_account_id.clone())
            .unwrap_or_default(),
        JobPayload::InboxPoll(p) => p.social_account_id.clone(),
    };
    let mut line = format!(
        "{} | {} | {} | attempt {}/{}",
        job.id,
        job.state.as_str(),
        target,
        job.attempts_made,
        job.max_attempts
    );
    if let Some(error) = &job.last_error {
        line.push_str(" | ");
        line.push_str(error);
    }
    line
}

async fn cmd_retry(queues: &Queues, queue: Option<QueueName>) -> anyhow::Result<()> {
    let names = match queue {
        Some(name) => vec![name],
        None => QueueName::ALL.to_vec(),
    };
    for name in names {
        let moved = queues.get(name).retry_failed().await?;
        tracing::debug!(queue = %name, moved, "Re-enqueued failed jobs");
        println!("{}\t{}", name, moved);
    }
    Ok(())
}

fn cmd_seal_token(config: &Config, use_stdin: bool) -> anyhow::Result<()> {
    let vault = CredentialVault::from_config(&config.vault)?;

    let token = if use_stdin || !atty::is(atty::Stream::Stdin) {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("reading token from stdin")?;
        buffer
    } else {
        rpassword::prompt_password("Access token: ").context("reading token")?
    };

    let token = token.trim();
    if token.is_empty() {
        bail!(SyndicastError::InvalidInput("token is empty".to_string()));
    }

    println!("{}", vault.encrypt(token)?);
    Ok(())
}
