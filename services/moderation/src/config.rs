use pinwall_pipeline::KafkaConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the moderation service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Safety analysis configuration
    pub safety: SafetyConfig,
    /// Blob storage configuration
    pub blob: BlobConfig,
    /// Read store configuration
    pub database: DatabaseConfig,
    /// Retry policy for read-store races
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

/// Safety analysis capability configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    /// Analysis API endpoint
    pub endpoint: String,
    /// Subscription key for the analysis API
    pub api_key: String,
    /// API version parameter
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Image severity at or above which content is refused
    #[serde(default = "default_image_severity_threshold")]
    pub image_severity_threshold: u8,
    /// Concurrent analysis calls; deliberately low, the capability is
    /// rate limited externally
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
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
    /// Public base URL blobs are served from
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
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
}

/// Bounded retry for verdict writes racing the projector's create
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
    "moderation-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

fn default_api_version() -> String {
    "2024-09-01".to_string()
}

fn default_image_severity_threshold() -> u8 {
    2
}

fn default_max_concurrent() -> usize {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
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

fn default_public_base_url() -> String {
    "http://localhost:9000".to_string()
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

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    3000
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
            .set_default("service.name", "moderation-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9091)?
            // Add config file if present
            .add_source(config::File::with_name("config/moderation").required(false))
            .add_source(config::File::with_name("/etc/pinwall/moderation").required(false))
            // Override with environment variables
            // MODERATION__SAFETY__ENDPOINT -> safety.endpoint
            .add_source(
                config::Environment::with_prefix("MODERATION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get safety request timeout as Duration
    pub fn safety_request_timeout(&self) -> Duration {
        Duration::from_secs(self.safety.request_timeout_secs)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Fixed delay between verdict-write attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_concurrent(), 1);
        assert_eq!(default_image_severity_threshold(), 2);
        assert_eq!(default_retry_max_attempts(), 5);
    }
}
