use std::future::ready;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_ack_tracker::{config::Config, service::AckTrackerService};

const BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0,
];

pub async fn index() -> &'static str {
    "kafka ack tracker service"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let recorder_handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder_handle.render())));

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server on {bind}: {e:#}");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!("Metrics server stopped: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Kafka ack tracker service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let service = AckTrackerService::new(config)
        .context("Failed to create Kafka ack tracker service")?;

    // Blocks until shutdown; a fail-fast retry exhaustion surfaces here
    let result = service.run().await;

    server_handle.abort();
    result
}
