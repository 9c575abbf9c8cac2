mod config;
mod projector;
mod store;

use anyhow::{Context, Result};
use crate::config::Config;
use pinwall_pipeline::consumer::EventSubscriber;
use pinwall_pipeline::producer::PinwallProducer;
use projector::{Projector, UrlScheme};
use std::sync::Arc;
use store::ReadStore;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Pinwall Projector Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize the read store
    let store = ReadStore::new(&config.database)
        .await
        .context("Failed to initialize read store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run read model migrations")?;
    }

    // Producer used only for dead-lettering unprocessable events
    let dlq_producer = Arc::new(
        PinwallProducer::new(config.kafka.clone())
            .context("Failed to initialize Kafka producer")?,
    );

    let projector = Arc::new(Projector::new(
        store,
        UrlScheme::new(&config.blob_urls),
        config.retry.clone(),
    ));

    // Create the event subscriber
    let subscriber = Arc::new(
        EventSubscriber::new(config.kafka.clone())
            .context("Failed to initialize event subscriber")?
            .with_dlq_producer(dlq_producer),
    );

    // Spawn the subscriber loop
    let subscriber_task = subscriber.clone();
    let subscriber_handle = tokio::spawn(async move {
        if let Err(e) = subscriber_task.run(projector).await {
            error!(error = %e, "Event subscriber error");
        }
    });

    info!("Projector service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down projector service");

    // Stop consuming; the final checkpoint is committed before run
    // returns.
    subscriber.shutdown();
    let _ = subscriber_handle.await;

    info!("Projector service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
