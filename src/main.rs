use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use mesh_stats_gateway::{
    aggregator::Aggregator,
    api::{self, ApiState, PublicService},
    backend::PrometheusBackend,
    config::GatewayConfig,
    inventory::KubernetesInventory,
    logging,
    metrics::GatewayMetrics,
    tap::{DisabledTapSource, HttpTapSource, TapEventSource},
    GatewayError, Result,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "gateway stopped");
        eprintln!("mesh-stats-gateway: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = GatewayConfig::from_env()?;
    logging::init_logger(config.log_format)?;

    let metrics = GatewayMetrics::new()?;
    let backend = PrometheusBackend::new(&config.prometheus_url, config.backend_timeout)?;
    let inventory = KubernetesInventory::new(
        &config.kubernetes_api_url,
        config.kubernetes_token()?,
        config.backend_timeout,
    )?;
    let tap_source: Arc<dyn TapEventSource> = match &config.tap_url {
        Some(url) => Arc::new(HttpTapSource::new(url, config.backend_timeout)?),
        None => Arc::new(DisabledTapSource),
    };

    let aggregator = Aggregator::new(Arc::new(backend), Arc::new(inventory), metrics.clone());
    let service = PublicService::new(
        aggregator,
        tap_source,
        metrics.clone(),
        &config.controller_namespace,
    );
    let app = api::router(ApiState::new(service, metrics));

    let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
        GatewayError::Internal(format!("Failed to bind to {}: {}", config.listen_addr, e))
    })?;
    info!(
        addr = %config.listen_addr,
        prometheus = %config.prometheus_url,
        tap = config.tap_url.is_some(),
        "Starting mesh stats gateway"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    info!("Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
