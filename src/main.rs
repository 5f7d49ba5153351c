use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use castrelay::cache::FeedCache;
use castrelay::concurrency::ConcurrencyCoordinator;
use castrelay::config::Config;
use castrelay::database::Database;
use castrelay::events::{Event, EventBus};
use castrelay::feed::FeedGenerator;
use castrelay::fetcher::{Fetcher, ProcessFetcher};
use castrelay::logging;
use castrelay::metrics::Metrics;
use castrelay::pipeline::worker::WorkerPool;
use castrelay::pipeline::Pipeline;
use castrelay::queue::DownloadQueue;
use castrelay::retention::{RetentionCleaner, RetentionTicker};
use castrelay::scheduler::RefreshScheduler;
use castrelay::transcoder::{ProcessTranscoder, Transcoder};
use castrelay::web::WebServer;

/// External binary names; these are assumed to be on `PATH` (spec §6's C2/C3
/// adapters name no specific tool, only the newline-JSON/ffprobe-style
/// contract their subprocess output must satisfy).
const FETCHER_BINARY: &str = "yt-dlp";
const TRANSCODER_BINARY: &str = "ffmpeg";
const PROBE_BINARY: &str = "ffprobe";

/// How often an idle worker re-polls the queue, and how often it additionally
/// checks for entries that have come due for retry.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WORKER_RETRY_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "castrelay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ingests remote video channels and republishes them as podcast feeds")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address (overrides config file)
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level (overrides config file)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    let _logging_guard = logging::init(&config.logging, cli.log_level.as_deref());
    info!("starting castrelay v{}", env!("CARGO_PKG_VERSION"));
    info!(path = %cli.config, "configuration loaded");

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;
    info!(url = %config.database.url, "database connected and migrated");

    tokio::fs::create_dir_all(&config.storage.download_dir).await?;
    tokio::fs::create_dir_all(&config.storage.temp_dir).await?;

    let events = EventBus::new();
    let metrics = Arc::new(Metrics::new());
    let queue = DownloadQueue::new(db.clone());

    let fetcher: Arc<dyn Fetcher> = Arc::new(ProcessFetcher::new(
        FETCHER_BINARY,
        Duration::from_secs(config.ingestion.probe_timeout_secs),
        Duration::from_secs(config.ingestion.fetch_timeout_secs),
    ));
    let transcoder: Arc<dyn Transcoder> = Arc::new(ProcessTranscoder::new(
        TRANSCODER_BINARY,
        PROBE_BINARY,
        Duration::from_secs(config.ingestion.transcode_timeout_secs),
        Duration::from_secs(config.ingestion.probe_timeout_secs),
    ));
    let concurrency = Arc::new(ConcurrencyCoordinator::new(config.max_concurrent_downloads()));

    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        fetcher.clone(),
        transcoder,
        concurrency,
        events.clone(),
        metrics.clone(),
        config.storage.clone(),
        config.transcode.clone(),
    ));

    let worker_pool = WorkerPool::new(
        queue.clone(),
        pipeline,
        config.max_concurrent_downloads(),
        WORKER_POLL_INTERVAL,
        WORKER_RETRY_POLL_INTERVAL,
    );
    worker_pool.start().await;
    info!(workers = config.max_concurrent_downloads(), "ingestion worker pool started");

    let scheduler = RefreshScheduler::new(
        db.clone(),
        fetcher,
        queue.clone(),
        Duration::from_secs(config.ingestion.refresh_interval_secs),
        config.ingestion.run_immediately_on_start,
    );
    scheduler.start().await;
    info!(
        interval_secs = config.ingestion.refresh_interval_secs,
        "refresh scheduler started"
    );

    let retention_cleaner = RetentionCleaner::new(db.clone(), events.clone(), config.storage.clone());
    let retention_ticker = RetentionTicker::new(
        retention_cleaner,
        Duration::from_secs(config.ingestion.retention_interval_secs),
    );
    retention_ticker.start().await;
    info!(
        interval_secs = config.ingestion.retention_interval_secs,
        "retention ticker started"
    );

    let feed_cache = Arc::new(FeedCache::new());
    spawn_cache_invalidator(events.clone(), feed_cache.clone());
    spawn_metrics_recorder(events.clone(), metrics.clone());
    spawn_queue_gauge_refresher(queue.clone(), metrics.clone());

    let feed_generator = Arc::new(FeedGenerator::new(db.clone(), &config.web));
    let web_server = WebServer::new(&config, feed_generator, feed_cache)?;
    info!(host = %web_server.host(), port = web_server.port(), "starting web server");

    let result = web_server.serve().await;

    scheduler.shutdown().await;
    retention_ticker.shutdown().await;
    worker_pool.shutdown().await;

    result.map_err(Into::into)
}

/// C10 subscriber: invalidates a channel's cached feeds whenever the
/// pipeline completes an item for it (spec §4.9).
fn spawn_cache_invalidator(events: EventBus, cache: Arc<FeedCache>) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Event::ItemCompleted { channel_id }) => cache.invalidate_channel(channel_id),
                Ok(Event::ChannelRetentionRan { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cache invalidator lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// C11 subscriber: records both event kinds into the metrics sink (spec §4.9).
fn spawn_metrics_recorder(events: EventBus, metrics: Arc<Metrics>) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(Event::ItemCompleted { .. }) => metrics.record_item_completed_event(),
                Ok(Event::ChannelRetentionRan { freed_bytes, .. }) => {
                    metrics.record_retention_event(freed_bytes)
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "metrics recorder lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Periodically refreshes the queue-depth gauges C11 exposes, since nothing
/// else in the pipeline naturally observes aggregate queue state. Runs for
/// the process lifetime; there is no operation that stops polling short of
/// process exit, so it carries no cancellation token of its own.
fn spawn_queue_gauge_refresher(queue: DownloadQueue, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        loop {
            match queue.counts_by_status().await {
                Ok(counts) => {
                    let mut pending = 0i64;
                    let mut in_progress = 0i64;
                    let mut retrying = 0i64;
                    for (status, count) in counts {
                        match status {
                            castrelay::models::QueueStatus::Pending => pending = count,
                            castrelay::models::QueueStatus::InProgress => in_progress = count,
                            castrelay::models::QueueStatus::Retrying => retrying = count,
                            _ => {}
                        }
                    }
                    metrics.set_queue_gauges(pending, in_progress, retrying);
                }
                Err(e) => error!(error = %e, "failed to refresh queue gauges"),
            }
            tokio::time::sleep(Duration::from_secs(15)).await;
        }
    });
}
