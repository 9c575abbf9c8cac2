use pinwall_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the resize service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Blob storage configuration
    pub blob: BlobConfig,
    /// Resize parameters
    #[serde(default)]
    pub resize: ResizeConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Bucket holding blobs awaiting a verdict
    #[serde(default = "default_unvalidated_bucket")]
    pub unvalidated_bucket: String,
    /// Bucket holding blobs that passed through moderation
    #[serde(default = "default_validated_bucket")]
    pub validated_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Resize parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ResizeConfig {
    /// Target width in pixels; height follows the aspect ratio
    #[serde(default = "default_target_width")]
    pub target_width: u32,
    /// Floor on per-image processing time in milliseconds, modelling the
    /// latency of the real transform backend
    #[serde(default = "default_min_processing_ms")]
    pub min_processing_ms: u64,
    /// Concurrent transforms; resizing is cheaper than safety analysis so
    /// this runs wider than the moderation worker
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

// Default value functions
fn default_service_name() -> String {
    "resize-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9092
}

fn default_unvalidated_bucket() -> String {
    "unvalidated".to_string()
}

fn default_validated_bucket() -> String {
    "validated".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_target_width() -> u32 {
    500
}

fn default_min_processing_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            target_width: default_target_width(),
            min_processing_ms: default_min_processing_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "resize-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9092)?
            // Add config file if present
            .add_source(config::File::with_name("config/resize").required(false))
            .add_source(config::File::with_name("/etc/pinwall/resize").required(false))
            // Override with environment variables
            // RESIZE__BLOB__UNVALIDATED_BUCKET -> blob.unvalidated_bucket
            .add_source(
                config::Environment::with_prefix("RESIZE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Floor on per-image processing time
    pub fn min_processing_latency(&self) -> Duration {
        Duration::from_millis(self.resize.min_processing_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_target_width(), 500);
        assert_eq!(default_max_concurrent(), 5);
    }
}
