//! Receiver entry point: wires the cache, durable store, batcher, RPC
//! clients, and both server surfaces, then runs until SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tonic::transport::Server;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ctg_core::batch::{Batcher, CompositeSink, LogSink, Sink, SystemClock};
use ctg_core::config::Config;
use ctg_core::session::{PostgresRepository, RedisStore, SessionManager};
use ctg_proto::telemetry::v1::telemetry_ingest_server::TelemetryIngestServer;

use ctg_server::analysis::AnalysisSink;
use ctg_server::api::{create_router, ApiState};
use ctg_server::grpc::TelemetryService;
use ctg_server::hub::{run_prediction_consumer, run_processed_consumer, Hub};
use ctg_server::prediction::PredictionClient;

/// Ceiling on graceful teardown once the shutdown signal lands.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cfg = Config::from_env();
    info!(
        grpc_port = cfg.grpc_port,
        http_port = cfg.http_port,
        redis = %cfg.redis_url,
        "starting receiver"
    );

    // Storage tiers.
    let cache = Arc::new(
        RedisStore::connect(&cfg.redis_url)
            .await
            .context("failed to connect to Redis")?,
    );
    info!("connected to Redis");

    let repository = Arc::new(
        PostgresRepository::connect(&cfg.postgres_dsn)
            .await
            .context("failed to connect to PostgreSQL")?,
    );
    info!("connected to PostgreSQL");

    let manager = Arc::new(SessionManager::new(
        cache,
        repository,
        cfg.session_data_ttl_seconds,
    ));

    // Broadcast fabric.
    let hub = Arc::new(Hub::new());

    let analysis = Arc::new(
        AnalysisSink::connect(&cfg.feature_extractor_addr, Some(Arc::clone(&manager)))
            .await
            .context("failed to connect to feature extractor")?,
    );

    let (prediction, prediction_rx) = PredictionClient::connect(&cfg.ml_service_addr)
        .await
        .context("failed to connect to ML service")?;

    tokio::spawn(run_processed_consumer(
        Arc::clone(&hub),
        analysis.subscribe(),
    ));
    tokio::spawn(run_prediction_consumer(Arc::clone(&hub), prediction_rx));
    let prediction_task = prediction.spawn_consumer(analysis.subscribe());

    // Ingest pipeline: log first, then analytics.
    let composite = Arc::new(CompositeSink::new(vec![
        Arc::new(LogSink) as Arc<dyn Sink>,
        Arc::clone(&analysis) as Arc<dyn Sink>,
    ]));
    let batcher = Batcher::spawn(cfg.batcher.clone(), composite, Arc::new(SystemClock));

    // gRPC surface with the standard health service alongside.
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<TelemetryIngestServer<TelemetryService>>()
        .await;

    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", cfg.grpc_port)
        .parse()
        .context("invalid gRPC bind address")?;
    let ingest = TelemetryService::new(Arc::clone(&batcher), cfg.ack_every_n);

    tokio::spawn(async move {
        info!(%grpc_addr, "gRPC server listening");
        if let Err(err) = Server::builder()
            .add_service(health_service)
            .add_service(TelemetryIngestServer::new(ingest))
            .serve(grpc_addr)
            .await
        {
            error!(%err, "gRPC server error");
        }
    });

    // HTTP surface: control plane, health, WebSocket fan-out. CORS is
    // wide open for the development frontend.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_router(ApiState {
        manager: Arc::clone(&manager),
        hub: Arc::clone(&hub),
    })
    .layer(cors);

    let http_addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port)
        .parse()
        .context("invalid HTTP bind address")?;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;
    info!(%http_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Teardown: stop advertising, flush the batcher, drop the callers.
    info!("shutting down");
    health_reporter
        .set_not_serving::<TelemetryIngestServer<TelemetryService>>()
        .await;

    if tokio::time::timeout(SHUTDOWN_DEADLINE, batcher.stop())
        .await
        .is_err()
    {
        warn!("batcher did not stop within the shutdown deadline");
    }
    prediction_task.abort();

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("received shutdown signal");
}
