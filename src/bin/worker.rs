use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use sensiflow_image_processor::{
    app_state::AppState,
    config::{AppConfig, ConfigError},
    db,
    pipeline::{DrainReport, PipelineSettings, ProcessingPipeline},
    routes,
    services::{
        dead_letter::{DeadLetterError, RedisDeadLetterSink},
        detector::{DetectorError, HttpDetector},
        inference::InferenceEngine,
        queue::{RedisFrameSource, SourceError},
        result_store::PgResultStore,
        status::{RedisStatusPublisher, StatusError},
        storage::{BlobStore, StorageError},
    },
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database unavailable: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Blob store: {0}")]
    Blob(#[from] StorageError),

    #[error("Frame queue: {0}")]
    Queue(#[from] SourceError),

    #[error("Dead-letter sink: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("Status publisher: {0}")]
    Status(#[from] StatusError),

    #[error("Detector client: {0}")]
    Detector(#[from] DetectorError),

    #[error("Metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Could not bind ops endpoint: {0}")]
    Bind(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting sensiflow image processor");

    let token = CancellationToken::new();
    let signals = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Could not install signal handlers, shutting down");
        }
        signals.cancel();
    });

    match run(token).await {
        Ok(report) if report.is_clean() => {
            tracing::info!("Worker stopped cleanly");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            tracing::warn!(
                unacknowledged = report.unacknowledged,
                force_requeued = report.force_requeued,
                abandoned = report.abandoned,
                "Worker stopped with frames cut short"
            );
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker failed to start");
            ExitCode::from(2)
        }
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn run(shutdown: CancellationToken) -> Result<DrainReport, StartupError> {
    let config = AppConfig::from_env()?;
    let retry = config.retry_policy()?;

    // Initialize Prometheus metrics recorder
    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    routes::metrics::describe();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_pool_size, config.db_acquire_timeout()).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool).await?;

    let blobs = match config.blob() {
        Some(blob) => {
            tracing::info!(bucket = %blob.bucket, "Initializing blob store client");
            Some(Arc::new(BlobStore::new(&blob)?))
        }
        None => {
            tracing::info!("No blob store configured, only inline payloads will resolve");
            None
        }
    };

    tracing::info!(queue = %config.frame_queue, worker_id = %config.worker_id, "Connecting to frame queue");
    let source = Arc::new(
        RedisFrameSource::connect(&config.redis_url, &config.frame_queue, &config.worker_id, blobs).await?,
    );
    let dead_letters = Arc::new(RedisDeadLetterSink::connect(&config.redis_url, &config.dead_letter_queue).await?);
    let status = Arc::new(
        RedisStatusPublisher::connect(&config.redis_url, &config.status_queue, config.status_queue_max_len).await?,
    );

    tracing::info!(
        endpoint = %config.detector_url,
        slots = config.inference_concurrency,
        "Initializing detector client"
    );
    let detector = Arc::new(HttpDetector::new(&config.detector_url, config.detector_api_token.clone())?);
    let engine = Arc::new(
        InferenceEngine::new(detector, config.inference_concurrency, config.inference_timeout())
            .with_min_confidence(config.min_confidence),
    );

    let store = Arc::new(PgResultStore::new(db_pool.clone(), config.persist_timeout()));

    let state = AppState::new(db_pool, source.clone(), engine.clone());
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Ops endpoint listening on {}", config.bind_addr);

    let ops_shutdown = shutdown.clone();
    let ops = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move { ops_shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "Ops endpoint failed");
        }
    });

    let pipeline = Arc::new(ProcessingPipeline::new(
        source,
        engine,
        store,
        dead_letters,
        status,
        retry,
        PipelineSettings::from_config(&config),
    ));
    let report = pipeline.run(shutdown).await;

    if let Err(e) = ops.await {
        tracing::warn!(error = %e, "Ops endpoint task ended abnormally");
    }
    Ok(report)
}
