use pinwall_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the projector service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Read store configuration
    pub database: DatabaseConfig,
    /// Blob URL scheme used when materializing records
    #[serde(default)]
    pub blob_urls: BlobUrlConfig,
    /// Retry policy for out-of-order events
    #[serde(default)]
    pub retry: RetryConfig,
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

/// Read store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Where blobs are served from; the projector derives post URLs from the
/// event payload and this scheme
#[derive(Debug, Clone, Deserialize)]
pub struct BlobUrlConfig {
    /// Public base URL blobs are served from
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Bucket holding blobs awaiting a verdict
    #[serde(default = "default_unvalidated_bucket")]
    pub unvalidated_bucket: String,
    /// Bucket holding blobs that passed through moderation
    #[serde(default = "default_validated_bucket")]
    pub validated_bucket: String,
}

/// Bounded retry for patch/delete events racing ahead of their create.
///
/// The ceiling is deliberately finite: an event whose target never shows
/// up is surfaced as a terminal error and dead-lettered instead of
/// blocking the partition forever.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a missing target is a terminal error
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "projector-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9093
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_run_migrations() -> bool {
    true
}

fn default_public_base_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_unvalidated_bucket() -> String {
    "unvalidated".to_string()
}

fn default_validated_bucket() -> String {
    "validated".to_string()
}

fn default_retry_max_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    3000
}

impl Default for BlobUrlConfig {
    fn default() -> Self {
        Self {
            public_base_url: default_public_base_url(),
            unvalidated_bucket: default_unvalidated_bucket(),
            validated_bucket: default_validated_bucket(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "projector-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9093)?
            // Add config file if present
            .add_source(config::File::with_name("config/projector").required(false))
            .add_source(config::File::with_name("/etc/pinwall/projector").required(false))
            // Override with environment variables
            // PROJECTOR__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("PROJECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Fixed delay between apply attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_retry_max_attempts(), 10);
        assert!(default_run_migrations());
    }
}
