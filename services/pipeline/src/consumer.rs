//! Event bus subscriber for the Pinwall pipeline.
//!
//! Consumption starts at the consumer group's last committed offset (the
//! checkpoint) and the checkpoint only advances after the handler has
//! durably applied an event. A crash between apply and commit means
//! redelivery, so every apply must be idempotent. Order is guaranteed only
//! within a partition; events are keyed by post id on the producer side so
//! per-post order holds.
//!
//! Events are applied strictly in partition order, one at a time: the read
//! model is a fold over the log and reordering the fold would reorder
//! state transitions.

use crate::config::KafkaConfig;
use crate::event::Event;
use crate::producer::PinwallProducer;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during event consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit checkpoint: {0}")]
    CommitError(String),

    #[error("Undecodable event: {0}")]
    PoisonEvent(String),

    #[error("Failed to apply event: {0}")]
    ApplyError(String),

    #[error("Consumer shutdown")]
    Shutdown,
}

/// Handler applying events to downstream state.
///
/// `apply` must be idempotent: at-least-once delivery means the same event
/// can arrive again after a crash-before-checkpoint.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Apply a single event
    async fn apply(&self, event: Event) -> Result<(), ConsumerError>;

    /// Called when an event could not be applied
    async fn on_error(&self, event: &Event, error: &ConsumerError) {
        warn!(
            action = ?event.action,
            media_type = ?event.media_type,
            post_id = %event.post_id,
            error = %error,
            "Event apply failed"
        );
    }
}

/// Checkpointed subscriber for the event topic
pub struct EventSubscriber {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: broadcast::Sender<()>,
    dlq_producer: Option<Arc<PinwallProducer>>,
}

impl EventSubscriber {
    /// Create a new subscriber and subscribe to the event topic
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            topic = %config.topics.events,
            group = %config.consumer.group_id,
            "Creating event subscriber"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.topics.events.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
            dlq_producer: None,
        })
    }

    /// Set the dead letter queue producer for poison and terminally failed
    /// events
    pub fn with_dlq_producer(mut self, producer: Arc<PinwallProducer>) -> Self {
        self.dlq_producer = Some(producer);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling event subscriber shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Consume events and apply them with the given handler.
    ///
    /// A poison payload or a terminally failed apply is parked on the DLQ
    /// and the checkpoint advances past it, so one bad event never wedges
    /// its partition.
    #[instrument(skip(self, handler))]
    pub async fn run<H: EventHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting event consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(message)) => {
                            let payload = message.payload().unwrap_or(&[]);
                            debug!(
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received event"
                            );

                            match decode_event(payload) {
                                Ok(event) => {
                                    if let Err(e) = handler.apply(event.clone()).await {
                                        handler.on_error(&event, &e).await;
                                        self.park(payload, &e.to_string()).await;
                                        metrics::counter!("pipeline.events.failed").increment(1);
                                    } else {
                                        metrics::counter!("pipeline.events.applied").increment(1);
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Skipping poison event");
                                    self.park(payload, &e.to_string()).await;
                                    metrics::counter!("pipeline.events.poison").increment(1);
                                }
                            }

                            // Checkpoint after apply: committing first would
                            // risk losing the event on a crash.
                            if let Err(e) =
                                self.consumer.commit_message(&message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit checkpoint");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // Final synchronous checkpoint before releasing the connection
        if let Err(e) = self
            .consumer
            .commit_consumer_state(CommitMode::Sync)
        {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        info!("Event subscriber stopped");
        Ok(())
    }

    /// Park an unprocessable event on the DLQ, if one is configured
    async fn park(&self, payload: &[u8], reason: &str) {
        if let Some(ref dlq) = self.dlq_producer {
            if let Err(e) = dlq
                .send_to_dlq(&self.config.topics.events, payload, reason, 1)
                .await
            {
                error!(error = %e, "Failed to dead-letter event");
            }
        }
    }
}

/// Decode and structurally check an event payload
fn decode_event(payload: &[u8]) -> Result<Event, ConsumerError> {
    let event: Event = serde_json::from_slice(payload)
        .map_err(|e| ConsumerError::PoisonEvent(e.to_string()))?;
    event
        .check()
        .map_err(|e| ConsumerError::PoisonEvent(e.to_string()))?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventAction, MediaType};

    #[test]
    fn test_decode_event() {
        let payload = br#"{
            "mediaType": "Image",
            "action": "Submitted",
            "postId": "550e8400-e29b-41d4-a716-446655440000",
            "commentId": null,
            "data": "blob-id"
        }"#;

        let event = decode_event(payload).unwrap();
        assert_eq!(event.media_type, MediaType::Image);
        assert_eq!(event.action, EventAction::Submitted);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_event(b"not json"),
            Err(ConsumerError::PoisonEvent(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_action() {
        let payload = br#"{
            "mediaType": "Image",
            "action": "Exploded",
            "postId": "550e8400-e29b-41d4-a716-446655440000",
            "data": ""
        }"#;
        assert!(matches!(
            decode_event(payload),
            Err(ConsumerError::PoisonEvent(_))
        ));
    }

    #[test]
    fn test_decode_rejects_comment_id_on_image() {
        let payload = br#"{
            "mediaType": "Image",
            "action": "Validated",
            "postId": "550e8400-e29b-41d4-a716-446655440000",
            "commentId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "data": ""
        }"#;
        assert!(matches!(
            decode_event(payload),
            Err(ConsumerError::PoisonEvent(_))
        ));
    }
}
