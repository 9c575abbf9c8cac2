mod blob;
mod config;
mod resizer;
mod worker;

use anyhow::{Context, Result};
use blob::ImageStore;
use crate::config::Config;
use pinwall_pipeline::producer::PinwallProducer;
use pinwall_pipeline::queue::JobConsumer;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use worker::ResizeWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Pinwall Resize Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let images = ImageStore::new(&config.blob)
        .await
        .context("Failed to initialize image store")?;

    let producer = Arc::new(
        PinwallProducer::new(config.kafka.clone())
            .context("Failed to initialize Kafka producer")?,
    );

    let worker = Arc::new(ResizeWorker::new(images, producer.clone(), &config.resize));

    // Create the job consumer for the resize queue
    let resize_topic = config.kafka.topics.resize_jobs.clone();
    let consumer = Arc::new(
        JobConsumer::new(config.kafka.clone(), producer.clone(), resize_topic)
            .context("Failed to initialize job consumer")?,
    );

    // Spawn the consumer loop
    let consumer_task = consumer.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer_task.run(worker).await {
            error!(error = %e, "Job consumer error");
        }
    });

    info!("Resize service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down resize service");

    // Stop accepting new deliveries; in-flight ones settle before run
    // returns.
    consumer.shutdown();
    let _ = consumer_handle.await;

    info!("Resize service stopped");

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
