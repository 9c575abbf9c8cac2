//! Kafka producer wrapper for the Pinwall pipeline.
//!
//! One producer type carries every outbound path: appending lifecycle
//! events to the event topic, enqueuing resize/validation jobs, re-queueing
//! abandoned deliveries and dead-lettering poison messages. Sends are
//! wrapped in a capped exponential backoff with a bounded attempt count;
//! when the attempts are exhausted the send fails and the caller owns the
//! dropped side effect.

use crate::config::KafkaConfig;
use crate::event::Event;
use crate::queue::{ResizeJob, ValidationJob, HEADER_DELIVERY_COUNT, HEADER_MESSAGE_TYPE, HEADER_VISIBLE_AT};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Event of {size} bytes exceeds the {limit} byte batch limit")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Send to topic {topic} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        message: String,
    },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Create a message from pre-serialized bytes
    pub fn from_bytes(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header(HEADER_MESSAGE_TYPE, msg_type)
    }

    /// Stamp the queue delivery count header
    pub fn with_delivery_count(self, count: u32) -> Self {
        self.with_header(HEADER_DELIVERY_COUNT, count.to_string())
    }

    /// Defer visibility of the message until the given instant
    pub fn with_visible_at(self, visible_at: DateTime<Utc>) -> Self {
        self.with_header(HEADER_VISIBLE_AT, visible_at.timestamp_millis().to_string())
    }
}

/// High-level Kafka producer wrapper
pub struct PinwallProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl PinwallProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer_config = config.build_producer_config();
        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message once and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic).payload(&message.payload);

        if let Some(ref k) = key {
            record = record.key(k);
        }

        if !message.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (name, value) in &message.headers {
                headers = headers.insert(Header {
                    key: name,
                    value: Some(value),
                });
            }
            record = record.headers(headers);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            topic,
            message.payload.len()
        );

        let delivery_result = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        Ok(DeliveryResult {
            topic,
            partition: delivery_result.0,
            offset: delivery_result.1,
            key,
        })
    }

    /// Send a message, retrying transient failures with capped exponential
    /// backoff up to the configured attempt ceiling.
    pub async fn send_reliable(
        &self,
        message: OutgoingMessage,
    ) -> Result<DeliveryResult, ProducerError> {
        let reliability = &self.config.reliability;
        let max_attempts = reliability.send_attempts.max(1);

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(reliability.send_backoff_ms),
            max_interval: Duration::from_millis(reliability.send_max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send(message.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < max_attempts => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(reliability.send_max_backoff_ms));
                    warn!(
                        topic = %message.topic,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("pipeline.producer.sends_exhausted").increment(1);
                    return Err(ProducerError::RetriesExhausted {
                        topic: message.topic.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Append a lifecycle event to the event topic.
    ///
    /// Events are keyed by post id so per-post order holds within one
    /// partition. An event whose serialized form exceeds the configured
    /// byte limit is rejected outright; the caller must log and drop it,
    /// never retry, because its size will not decrease.
    #[instrument(skip(self, event), fields(action = ?event.action, post_id = %event.post_id))]
    pub async fn publish_event(&self, event: &Event) -> Result<DeliveryResult, ProducerError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        self.check_event_size(payload.len())?;

        let message = OutgoingMessage::from_bytes(&self.config.topics.events, payload)
            .with_key(event.partition_key())
            .with_message_type("event");

        let result = self.send_reliable(message).await?;
        metrics::counter!("pipeline.events.published").increment(1);
        Ok(result)
    }

    /// Append a batch of events.
    ///
    /// The whole batch fails before anything is sent if any single event
    /// exceeds the byte limit.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn publish_events(
        &self,
        events: &[Event],
    ) -> Result<Vec<DeliveryResult>, ProducerError> {
        let mut payloads = Vec::with_capacity(events.len());
        for event in events {
            let payload = serde_json::to_vec(event)
                .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
            self.check_event_size(payload.len())?;
            payloads.push(payload);
        }

        let futures: Vec<_> = events
            .iter()
            .zip(payloads)
            .map(|(event, payload)| {
                let message = OutgoingMessage::from_bytes(&self.config.topics.events, payload)
                    .with_key(event.partition_key())
                    .with_message_type("event");
                self.send_reliable(message)
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        results.into_iter().collect()
    }

    fn check_event_size(&self, size: usize) -> Result<(), ProducerError> {
        let limit = self.config.producer.max_event_bytes;
        if size > limit {
            warn!(size = size, limit = limit, "Dropping oversized event");
            metrics::counter!("pipeline.events.oversized").increment(1);
            return Err(ProducerError::EventTooLarge { size, limit });
        }
        Ok(())
    }

    /// Enqueue an image resize job
    pub async fn enqueue_resize(&self, job: &ResizeJob) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::new_json(&self.config.topics.resize_jobs, job)?
            .with_key(job.post_id.to_string())
            .with_message_type("resize_job")
            .with_delivery_count(1);

        let result = self.send_reliable(message).await?;
        metrics::counter!("pipeline.jobs.resize_enqueued").increment(1);
        Ok(result)
    }

    /// Enqueue a content validation job.
    ///
    /// A non-zero `delay` keeps the job invisible to consumers until
    /// `now + delay`.
    pub async fn enqueue_validation(
        &self,
        job: &ValidationJob,
        delay: Duration,
    ) -> Result<DeliveryResult, ProducerError> {
        let mut message = OutgoingMessage::new_json(&self.config.topics.validation_jobs, job)?
            .with_key(job.post_id.to_string())
            .with_message_type("validation_job")
            .with_delivery_count(1);

        if !delay.is_zero() {
            let visible_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            message = message.with_visible_at(visible_at);
        }

        let result = self.send_reliable(message).await?;
        metrics::counter!("pipeline.jobs.validation_enqueued").increment(1);
        Ok(result)
    }

    /// Put a delivery back on its queue with an updated delivery count and
    /// visibility time. Used for abandoned messages and for deferrals too
    /// far away to wait out in-process.
    pub async fn requeue(
        &self,
        topic: &str,
        key: Option<String>,
        payload: Vec<u8>,
        delivery_count: u32,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<DeliveryResult, ProducerError> {
        let mut message =
            OutgoingMessage::from_bytes(topic, payload).with_delivery_count(delivery_count);
        if let Some(key) = key {
            message = message.with_key(key);
        }
        if let Some(visible_at) = visible_at {
            message = message.with_visible_at(visible_at);
        }

        self.send_reliable(message).await
    }

    /// Send a message to the dead letter queue
    pub async fn send_to_dlq(
        &self,
        original_topic: &str,
        original_message: &[u8],
        reason: &str,
        delivery_count: u32,
    ) -> Result<DeliveryResult, ProducerError> {
        let dlq_message = serde_json::json!({
            "original_topic": original_topic,
            "original_message": String::from_utf8_lossy(original_message),
            "reason": reason,
            "delivery_count": delivery_count,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let message =
            OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &dlq_message)?
                .with_message_type("dead_letter")
                .with_header("original-topic", original_topic)
                .with_header("error-reason", reason)
                .with_delivery_count(delivery_count);

        let result = self.send_reliable(message).await?;
        metrics::counter!("pipeline.messages.dead_lettered").increment(1);
        Ok(result)
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }

    /// Get the number of messages in the producer queue
    pub fn queue_len(&self) -> usize {
        self.producer.in_flight_count() as usize
    }
}

impl Drop for PinwallProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::from_bytes("test", vec![1, 2, 3])
            .with_key("my-key")
            .with_delivery_count(3)
            .with_message_type("resize_job");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
        assert!(message
            .headers
            .iter()
            .any(|(k, v)| k == HEADER_DELIVERY_COUNT && v == "3"));
    }

    #[test]
    fn test_visible_at_header_is_epoch_millis() {
        let visible_at = Utc::now();
        let message =
            OutgoingMessage::from_bytes("test", vec![]).with_visible_at(visible_at);

        let (_, value) = message
            .headers
            .iter()
            .find(|(k, _)| k == HEADER_VISIBLE_AT)
            .unwrap();
        assert_eq!(value, &visible_at.timestamp_millis().to_string());
    }

    #[test]
    fn test_new_json_serializes_job() {
        let job = ResizeJob {
            image_id: Uuid::new_v4(),
            post_id: Uuid::new_v4(),
        };
        let message = OutgoingMessage::new_json("jobs", &job).unwrap();
        let decoded: ResizeJob = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded, job);
    }
}
