//! Contract Export Worker Service
//!
//! Consumes contract export jobs from a Redis queue and renders them to DOCX
//! or ODT, reusing cached renders when the contract has not changed.
//!
//! ## Architecture
//!
//! - **Queue**: Redis list (`contracts:export:queue`)
//! - **Status**: Redis keys (`contracts:export:status:{job_id}`)
//! - **Read model**: Redis projection (`contracts:read:*`)
//! - **Storage**: filesystem object store (`EXPORT_STORAGE_ROOT`)
//! - **Autoscaler**: adjusts concurrency from queue depth
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! See `contract_export_worker::config` for every variable. Additionally:
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: log filter (default: info)
//! - `LOG_FORMAT`: `json` for JSON log lines

use anyhow::{Context, Result};
use contract_export_worker::{
    autoscaler::AutoScaler,
    config::WorkerConfig,
    converter::SofficeConverter,
    pipeline::ExportPipeline,
    prewarm::pre_warm_templates,
    queue::JobQueue,
    read_model::{ReadModel, RedisReadModel},
    render::{engine::DocxTemplateEngine, Renderer},
    storage::{FsObjectStore, ObjectStore},
    telemetry,
    template_cache::SharedTemplateCache,
    worker::{ConcurrencyLimiter, Worker},
};
use redis::Client;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting contract export worker service");

    let config = WorkerConfig::from_env();
    info!(
        redis_url = %config.redis_url,
        storage_root = %config.storage_root.display(),
        concurrency = config.initial_concurrency,
        min_concurrency = config.autoscaler.min_concurrency,
        max_concurrency = config.autoscaler.max_concurrency,
        "Configuration loaded"
    );

    let client = Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis");

    let read_model: Arc<dyn ReadModel> = Arc::new(RedisReadModel::new(conn.clone()));
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.storage_root.clone()));
    let templates = Arc::new(SharedTemplateCache::new(&config.template_cache));

    // Before intake; never fails startup.
    pre_warm_templates(read_model.as_ref(), store.as_ref(), &templates, config.pre_warm_limit).await;

    let renderer = Renderer::new(
        Arc::new(DocxTemplateEngine::new()),
        Arc::new(SofficeConverter::new(config.soffice_bin.clone())),
    );
    let pipeline = Arc::new(ExportPipeline::new(
        read_model,
        store,
        templates,
        renderer,
        &config,
    ));

    let queue = JobQueue::new(conn);
    let initial = config
        .initial_concurrency
        .clamp(config.autoscaler.min_concurrency, config.autoscaler.max_concurrency);
    let limiter = Arc::new(ConcurrencyLimiter::new(initial));

    let autoscaler = Arc::new(AutoScaler::new(
        config.autoscaler.clone(),
        initial,
        Arc::new(queue.clone()),
        limiter.clone(),
    ));
    autoscaler.on_scale(|event| {
        telemetry::record_scale_event(event);
        Ok(())
    });
    autoscaler.start();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(queue, pipeline, limiter);
    let dispatcher = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for workers to finish...");
    autoscaler.stop();
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        warn!("Dispatcher task ended abnormally: {}", e);
    }

    telemetry::shutdown_telemetry();
    info!("Worker service shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
