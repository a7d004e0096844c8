//! batchgate batch processor

use anyhow::Context;
use batchgate_config::load_processor_config;
use batchgate_core::JobEvent;
use batchgate_core::metrics::MetricsSink;
use batchgate_inference::HttpInferenceClient;
use batchgate_processor::{
    JobExecutor, JobSettings, ProcessorClients, PrometheusMetrics, RetryPolicy, Scheduler,
    Shutdown, listen_for_signals,
};
use batchgate_server::{AppState, MetricsServer, routes};
use batchgate_store::{
    BroadcastEventChannel, LocalFileStore, MemoryQueue, SpoolJobRepository, SpoolStatusStore,
};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Parser)]
#[command(name = "batch-processor", version, about = "Runs batch inference jobs")]
struct Args {
    /// Path to the KDL configuration file
    #[arg(long, env = "BATCHGATE_CONFIG", default_value = "batchgate.kdl")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn log_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(
                job_id = %event.job_id,
                tenant = %event.tenant_id,
                status = %event.status,
                kind = ?event.kind,
                "Job event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_processor_config(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    let storage = &config.storage;

    // Collaborators
    let events = Arc::new(BroadcastEventChannel::new(EVENT_CAPACITY));
    let event_log = tokio::spawn(log_events(events.subscribe()));
    let inference = HttpInferenceClient::from_config(&config.inference)
        .context("Failed to create inference client")?;
    info!(base_url = %inference.base_url(), "Inference backend configured");

    let clients = ProcessorClients {
        queue: Arc::new(MemoryQueue::new()),
        status: Arc::new(SpoolStatusStore::open(storage.spool_dir.clone()).await?),
        events,
        inference: Arc::new(inference),
        files: Arc::new(LocalFileStore::new(storage.files_root.clone())),
        repository: Arc::new(SpoolJobRepository::open(storage.spool_dir.clone()).await?),
    };

    let metrics = PrometheusMetrics::new(&config.metrics).context("Failed to register metrics")?;
    let sink: Arc<dyn MetricsSink> = Arc::new(metrics.clone());

    let executor = Arc::new(JobExecutor::new(
        clients.clone(),
        RetryPolicy::from(&config.retry),
        Arc::clone(&sink),
        JobSettings::from(&config),
    ));
    let scheduler = Scheduler::new(config.scheduler.clone(), &clients, executor, sink);

    // Metrics and health endpoints stay up through the drain
    let app = routes::router(AppState::new(metrics, scheduler.subscribe()))
        .layer(TraceLayer::new_for_http());
    let http = MetricsServer::start(&config.metrics, app).await?;

    let shutdown = Shutdown::new();
    let signals = listen_for_signals(shutdown.clone());

    info!(
        workers = config.scheduler.num_workers,
        max_job_concurrency = config.scheduler.max_job_concurrency,
        "Batch processor started"
    );
    scheduler.run(&shutdown).await;

    http.stop(shutdown.is_forced()).await;
    signals.abort();
    event_log.abort();

    if shutdown.is_forced() {
        warn!("Forced shutdown, running jobs were abandoned");
        std::process::exit(1);
    }

    info!("Batch processor stopped");
    Ok(())
}
