//! Taskflow Processor
//!
//! Consumes the main task queue. A processed task gets its status upserted
//! and is acked; a failed or malformed one is rejected without requeue and the
//! broker moves it to the dead-letter queue.
//!
//! Configuration is described in `tf-config`; the variables below are read
//! directly by this binary.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TF_CONFIG` | - | Optional TOML configuration file |
//! | `TF_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log filter |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tf_common::telemetry::{init_tracing, LogFormat};
use tf_config::AppConfig;
use tf_queue::amqp::AmqpBroker;
use tf_queue::{BrokerGateway, QueueSpec};
use tf_store::mongo::MongoStatusStore;
use tf_store::StatusStore;
use tf_worker::{ConsumerLoop, PrimaryProcessor, SimulatedProcessing};

/// Taskflow main-queue processor
#[derive(Parser, Debug)]
#[command(name = "tf-processor")]
#[command(about = "Processes tasks from the main queue and dead-letters failures")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "TF_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics/health port, overrides the configuration file
    #[arg(long, env = "TF_METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Clone)]
struct HttpState {
    prometheus: PrometheusHandle,
    ready: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load_with(args.config.as_deref(), |key| std::env::var(key).ok())?;
    if let Some(port) = args.metrics_port {
        config.http.metrics_port = port;
    }

    init_tracing(LogFormat::parse(&config.http.log_format));
    info!("Starting Taskflow Processor");

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Status store
    let status_store = Arc::new(
        MongoStatusStore::connect(
            &config.status_store.uri,
            &config.status_store.database,
            &config.status_store.collection,
        )
        .await?,
    );
    if let Err(e) = status_store.ensure_indexes().await {
        warn!(error = %e, "Could not ensure status store indexes");
    }
    info!(store = %status_store.identifier(), "Status store initialized");

    // Broker
    let broker = Arc::new(AmqpBroker::new(config.broker.url.clone()));
    broker
        .declare(&QueueSpec::durable(&config.broker.dead_letter_queue))
        .await?;
    broker
        .declare(
            &QueueSpec::durable(&config.broker.main_queue)
                .with_dead_letter(&config.broker.dead_letter_queue),
        )
        .await?;
    let consumer = broker.consumer(&config.broker.main_queue).await?;
    info!(broker = %broker.identifier(), queue = %config.broker.main_queue, "Broker initialized");

    let handler = SimulatedProcessing::new(
        Duration::from_millis(config.processing.simulated_work_ms),
        config.processing.failure_marker.clone(),
    );
    let processor = PrimaryProcessor::new(
        Arc::new(handler),
        status_store.clone(),
        config.retry.max_retries,
    );
    let consumer_loop = ConsumerLoop::new(consumer, Arc::new(processor));
    let loop_handle = tokio::spawn(consumer_loop.run(shutdown_tx.subscribe()));

    // Metrics server
    let ready = Arc::new(AtomicBool::new(true));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.http.metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(HttpState {
            prometheus,
            ready: ready.clone(),
        });

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("Taskflow Processor started");

    shutdown_signal().await;
    info!("Shutdown signal received...");
    ready.store(false, Ordering::SeqCst);
    let _ = shutdown_tx.send(());

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = loop_handle.await;
        let _ = metrics_handle.await;
    })
    .await;
    if drained.is_err() {
        warn!("Timed out waiting for the in-flight delivery");
    }

    broker.close().await;
    status_store.close().await;

    info!("Taskflow Processor shutdown complete");
    Ok(())
}

async fn metrics_handler(State(state): State<HttpState>) -> String {
    state.prometheus.render()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(State(state): State<HttpState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "READY" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "DRAINING" })))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
