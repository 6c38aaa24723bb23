//! Courier binary entry point.
//!
//! Usage: webhook-courier [--base-dir <dir>] <command>
//!
//! `run` starts the delivery worker until ctrl-c. The other commands are
//! one-shot operator actions against the same database.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use classified_retry::RetryPolicy;
use courier_config_and_utils::{init_logging_for_service, Config, Paths};
use std::path::PathBuf;
use std::sync::Arc;
use token_bucket_limiter::MultiLevelLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webhook_database::AsyncDatabase;
use webhook_delivery_scheduler::{
    DeletedFilter, DeliveryStatus, DeliveryWorker, EventFilter, EventOrder, HttpTransport,
    NewWebhookEvent, WebhookDeliveryScheduler, WorkerConfig,
};

/// Courier: reliable outbound webhook delivery.
#[derive(Parser, Debug)]
#[command(name = "webhook-courier")]
#[command(about = "Persisted, rate-limited webhook delivery with retries")]
struct Args {
    /// Directory holding config.json and the database.
    #[arg(long, env = "COURIER_HOME", global = true)]
    base_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver due webhooks until interrupted.
    Run {
        /// Endpoint receiving the webhooks. Overrides config.
        #[arg(long)]
        endpoint: Option<String>,

        /// Poll interval in milliseconds. Overrides config.
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Create a webhook event, or merge into the active one with the same key.
    Enqueue {
        #[arg(long)]
        key: String,

        #[arg(long = "type")]
        event_type: String,

        /// JSON body sent as-is.
        #[arg(long)]
        payload: String,

        #[arg(long)]
        transaction_id: Option<String>,

        /// Defaults to redelivery.max_retries from config.
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Print event counts per status.
    Status,
    /// List events as JSON lines, newest first.
    List {
        /// pending, processing, delivered, failed or cancelled.
        #[arg(long)]
        status: Option<String>,

        /// Show soft-deleted events instead of active ones.
        #[arg(long)]
        deleted: bool,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Cancel a pending, processing or failed event.
    Cancel { id: String },
    /// Give a failed event a fresh set of retries.
    Restart { id: String },
    /// Soft-delete an event.
    Delete { id: String },
    /// Undo a soft delete.
    Restore { id: String },
    /// Purge soft-deleted events older than the retention period.
    Cleanup {
        /// Overrides delivery.retention_days from config.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = match &args.base_dir {
        Some(dir) => Paths::with_base_dir(dir.clone()),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths).context("failed to load config")?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    let service = match args.command {
        Command::Run { .. } => "courier",
        _ => "courier-cli",
    };
    init_logging_for_service(service, &config.log_level);

    if let Command::Run {
        endpoint,
        poll_interval_ms,
    } = &args.command
    {
        if let Some(endpoint) = endpoint {
            config.endpoint_url = endpoint.clone();
        }
        if let Some(poll_interval_ms) = poll_interval_ms {
            config.delivery.poll_interval_ms = *poll_interval_ms;
        }
        config.validate().context("invalid configuration")?;
    }

    paths.ensure_dirs()?;
    let db = AsyncDatabase::open(&paths.database_file())
        .await
        .context("failed to open database")?;
    let scheduler = Arc::new(WebhookDeliveryScheduler::new(
        Arc::new(db),
        RetryPolicy::from(&config.redelivery),
    ));

    match args.command {
        Command::Run { .. } => run(scheduler, &config).await?,
        Command::Enqueue {
            key,
            event_type,
            payload,
            transaction_id,
            max_retries,
        } => {
            serde_json::from_str::<serde_json::Value>(&payload)
                .context("payload must be valid JSON")?;
            let mut event = NewWebhookEvent::new(
                key,
                event_type,
                payload,
                max_retries.unwrap_or(config.redelivery.max_retries),
            );
            if let Some(transaction_id) = transaction_id {
                event = event.with_transaction_id(transaction_id);
            }
            let (event, outcome) = scheduler.create(event).await?;
            println!("{outcome:?} {}", event.id);
        }
        Command::Status => {
            let stats = scheduler.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::List {
            status,
            deleted,
            limit,
        } => {
            let mut filter = EventFilter::default()
                .order_by(EventOrder::CreatedDesc)
                .limit(limit);
            if let Some(status) = status {
                let Some(status) = DeliveryStatus::parse(&status) else {
                    bail!("unknown status: {status}");
                };
                filter = filter.with_status(status);
            }
            if deleted {
                filter = filter.deleted(DeletedFilter::DeletedOnly);
            }
            for event in scheduler.list(filter).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Cancel { id } => print_status(&scheduler.cancel(&id).await?.status),
        Command::Restart { id } => print_status(&scheduler.restart(&id).await?.status),
        Command::Delete { id } => {
            scheduler.soft_delete(&id).await?;
            println!("deleted");
        }
        Command::Restore { id } => {
            scheduler.restore(&id).await?;
            println!("restored");
        }
        Command::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(config.delivery.retention_days);
            let cutoff = retention_cutoff(chrono::Utc::now(), days)?;
            let purged = scheduler.cleanup_older_than(cutoff).await?;
            println!("purged {purged}");
        }
    }

    Ok(())
}

async fn run(scheduler: Arc<WebhookDeliveryScheduler>, config: &Config) -> Result<()> {
    let endpoint = config.endpoint_url()?;
    let transport = HttpTransport::new(endpoint.clone(), config.delivery.request_timeout())?;
    let limiter = Arc::new(MultiLevelLimiter::from_config(&config.rate_limit));

    info!(
        endpoint = %endpoint,
        per_second = config.rate_limit.per_second,
        per_minute = config.rate_limit.per_minute,
        inline_retries = config.inline_retry.max_retries,
        "Configuration loaded"
    );

    let worker = DeliveryWorker::new(
        scheduler,
        Arc::new(transport),
        RetryPolicy::from(&config.inline_retry),
        WorkerConfig::from(&config.delivery),
    )
    .with_limiter(limiter);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal, finishing in-flight delivery...");
        shutdown.cancel();
    });

    worker.run(cancel).await;
    Ok(())
}

fn print_status(status: &DeliveryStatus) {
    println!("{status}");
}

fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    match now.checked_sub_signed(chrono::Duration::days(i64::from(days))) {
        Some(cutoff) => Ok(cutoff),
        None => bail!("retention of {days} days reaches past the earliest supported date"),
    }
}
