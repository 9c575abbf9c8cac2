//! Pinwall submit - command line producer for the moderation pipeline
//!
//! This binary stands in for the web tier: it invokes the producer entry
//! points exactly once per accepted submission:
//! - an image post enqueues a resize job, a deferred validation job and
//!   appends a Submitted(Image) event
//! - a text comment enqueues a validation job and appends a
//!   Submitted(Text) event
//! - a deletion appends a Deleted event

use anyhow::Result;
use pinwall_pipeline::prelude::*;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// Delay before an image validation job becomes visible, giving the resize
/// worker a head start on the same blob
const IMAGE_VALIDATION_DEFER: Duration = Duration::from_secs(300);

/// Submit an image post: two jobs and one event
async fn submit_post(producer: &PinwallProducer, image_id: Uuid) -> Result<()> {
    let post_id = Uuid::new_v4();

    producer
        .enqueue_resize(&ResizeJob { image_id, post_id })
        .await?;

    producer
        .enqueue_validation(
            &ValidationJob {
                content_type: ContentKind::Image,
                content: image_id.to_string(),
                comment_id: None,
                post_id,
            },
            IMAGE_VALIDATION_DEFER,
        )
        .await?;

    producer
        .publish_event(&Event::submitted_post(post_id, image_id))
        .await?;

    info!(post_id = %post_id, image_id = %image_id, "Submitted image post");
    Ok(())
}

/// Submit a text comment: one job and one event
async fn submit_comment(producer: &PinwallProducer, post_id: Uuid, text: &str) -> Result<()> {
    let comment_id = Uuid::new_v4();

    producer
        .enqueue_validation(
            &ValidationJob {
                content_type: ContentKind::Text,
                content: text.to_string(),
                comment_id: Some(comment_id),
                post_id,
            },
            Duration::ZERO,
        )
        .await?;

    producer
        .publish_event(&Event::submitted_comment(post_id, comment_id, text))
        .await?;

    info!(post_id = %post_id, comment_id = %comment_id, "Submitted comment");
    Ok(())
}

/// Record a post deletion
async fn delete_post(producer: &PinwallProducer, post_id: Uuid) -> Result<()> {
    producer
        .publish_event(&Event::post_deleted(post_id))
        .await?;

    info!(post_id = %post_id, "Recorded post deletion");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration from environment
    let config = KafkaConfig::from_env()?;
    info!("Kafka brokers: {}", config.bootstrap_servers);

    let producer = PinwallProducer::new(config)?;

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match mode {
        "post" => {
            let image_id = args
                .get(2)
                .map(|s| Uuid::parse_str(s))
                .transpose()?
                .unwrap_or_else(Uuid::new_v4);
            submit_post(&producer, image_id).await?;
        }
        "comment" => {
            let post_id = args
                .get(2)
                .map(|s| Uuid::parse_str(s))
                .transpose()?
                .unwrap_or_else(Uuid::new_v4);
            let text = args
                .get(3)
                .cloned()
                .unwrap_or_else(|| "hello from the submit tool".to_string());
            submit_comment(&producer, post_id, &text).await?;
        }
        "delete" => {
            let post_id = args
                .get(2)
                .map(|s| Uuid::parse_str(s))
                .transpose()?
                .unwrap_or_else(Uuid::new_v4);
            delete_post(&producer, post_id).await?;
        }
        _ => {
            println!("Usage: submit [post|comment|delete] [args]");
            println!();
            println!("Modes:");
            println!("  post [image-id]            - Submit an image post");
            println!("  comment [post-id] [text]   - Submit a text comment");
            println!("  delete [post-id]           - Record a post deletion");
            println!();
            println!("Environment variables:");
            println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
            println!("  KAFKA_CLIENT_ID         - Client ID (default: pinwall-pipeline)");
            println!("  KAFKA_SECURITY_PROTOCOL - Security protocol (plaintext, ssl, sasl_ssl)");
            println!("  KAFKA_SASL_USERNAME     - SASL username");
            println!("  KAFKA_SASL_PASSWORD     - SASL password");
        }
    }

    producer.flush(Duration::from_secs(5))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        // Should not panic with default values
        let config = KafkaConfig::from_env();
        assert!(config.is_ok());
    }
}
