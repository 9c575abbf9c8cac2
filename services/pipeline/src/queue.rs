//! Leased-delivery job queue on Kafka topics.
//!
//! Resize and validation jobs travel point-to-point: each delivery is
//! leased to exactly one consumer in the group and settled exactly once,
//! by completing it (offset committed), abandoning it (re-published with
//! an incremented delivery count, then committed) or dead-lettering it
//! (published to the DLQ topic with a reason, then committed). The delivery count and
//! deferred visibility live in message headers, so the policy is enforced
//! by the queue client and not by worker logic.
//!
//! Settlement is asynchronous and out of receive order: deliveries are
//! handed to a bounded pool of tasks while the receive loop keeps pulling.
//! Offsets are therefore committed through a per-partition tracker that
//! only ever advances to the highest contiguous settled offset, so a late
//! settle can never strand an earlier in-flight delivery.

use crate::config::KafkaConfig;
use crate::producer::PinwallProducer;
use chrono::{DateTime, TimeZone, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the queue-tracked delivery count
pub const HEADER_DELIVERY_COUNT: &str = "delivery-count";
/// Header deferring visibility until an epoch-millisecond instant
pub const HEADER_VISIBLE_AT: &str = "visible-at";
/// Header naming the payload shape
pub const HEADER_MESSAGE_TYPE: &str = "message-type";

/// Errors that can occur during job consumption
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Job processing error: {0}")]
    ProcessingError(String),

    #[error("Consumer shutdown")]
    Shutdown,
}

/// Image resize work item.
///
/// Wire format is a 2-element ordered pair `[imageId, postId]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Uuid, Uuid)", into = "(Uuid, Uuid)")]
pub struct ResizeJob {
    pub image_id: Uuid,
    pub post_id: Uuid,
}

impl From<(Uuid, Uuid)> for ResizeJob {
    fn from((image_id, post_id): (Uuid, Uuid)) -> Self {
        Self { image_id, post_id }
    }
}

impl From<ResizeJob> for (Uuid, Uuid) {
    fn from(job: ResizeJob) -> Self {
        (job.image_id, job.post_id)
    }
}

/// Kind of content carried by a validation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Text,
    Image,
}

/// Content validation work item.
///
/// `content` holds the raw text for comments and the blob identifier for
/// images; `comment_id` is present only for comment validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationJob {
    pub content_type: ContentKind,
    pub content: String,
    #[serde(default)]
    pub comment_id: Option<Uuid>,
    pub post_id: Uuid,
}

/// One leased delivery of a queue message
#[derive(Debug, Clone)]
pub struct JobDelivery {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<String>,
    /// Raw message payload
    pub payload: Vec<u8>,
    /// How many times the queue has delivered this message, this attempt
    /// included
    pub delivery_count: u32,
    /// Instant before which the message must stay invisible
    pub visible_at: Option<DateTime<Utc>>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

impl JobDelivery {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| QueueError::DeserializationError(e.to_string()))
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Get the message type header
    pub fn message_type(&self) -> Option<&str> {
        self.header(HEADER_MESSAGE_TYPE)
    }
}

/// How a failed delivery is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureDisposition {
    /// Re-publish with an incremented delivery count for a later retry
    Abandon,
    /// Terminal: park on the DLQ for manual inspection
    DeadLetter,
}

/// Queue-level retry policy: once the delivery count exceeds the ceiling
/// the message is dead-lettered instead of retried again.
fn failure_disposition(delivery_count: u32, max_delivery_attempts: u32) -> FailureDisposition {
    if delivery_count > max_delivery_attempts {
        FailureDisposition::DeadLetter
    } else {
        FailureDisposition::Abandon
    }
}

/// Per-partition progress used to commit out-of-order settlements.
///
/// `next` is the lowest offset not yet settled; `done` holds settled
/// offsets above it. The committable position only moves when the gap at
/// `next` closes.
#[derive(Debug, Default)]
struct PartitionProgress {
    next: i64,
    done: BTreeSet<i64>,
}

/// Tracks settled offsets and yields the highest contiguous commit position
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionProgress>,
}

impl OffsetTracker {
    /// Record a delivered offset. A rewind (redelivery below the current
    /// watermark after a rebalance) resets the watermark.
    pub fn deliver(&mut self, partition: i32, offset: i64) {
        let progress = self
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionProgress {
                next: offset,
                done: BTreeSet::new(),
            });
        if offset < progress.next {
            progress.next = offset;
            progress.done.retain(|o| *o >= offset);
        }
    }

    /// Record a settled offset; returns the new commit position (the next
    /// offset to consume) when the contiguous watermark advanced.
    pub fn settle(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let progress = self.partitions.get_mut(&partition)?;
        progress.done.insert(offset);

        let mut advanced = false;
        while progress.done.remove(&progress.next) {
            progress.next += 1;
            advanced = true;
        }
        advanced.then_some(progress.next)
    }
}

/// Handler trait for processing job deliveries.
///
/// Returning `Ok` completes the delivery; returning `Err` hands it to the
/// queue-level retry policy (abandon until the delivery-count ceiling,
/// then dead-letter).
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process a single delivery
    async fn handle(&self, delivery: &JobDelivery) -> Result<(), QueueError>;
}

/// Shared pieces a settlement task needs after the receive loop moved on
struct Settler {
    consumer: Arc<StreamConsumer>,
    producer: Arc<PinwallProducer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    topic: String,
    max_delivery_attempts: u32,
    redelivery_delay: Duration,
}

impl Settler {
    /// Mark the delivery settled and commit the contiguous watermark
    fn commit_settled(&self, partition: i32, offset: i64) {
        let advanced = {
            let mut tracker = self.offsets.lock().unwrap_or_else(|e| e.into_inner());
            tracker.settle(partition, offset)
        };

        if let Some(commit_offset) = advanced {
            let mut tpl = TopicPartitionList::new();
            if let Err(e) =
                tpl.add_partition_offset(&self.topic, partition, Offset::Offset(commit_offset))
            {
                warn!(error = %e, "Failed to build commit list");
                return;
            }
            if let Err(e) = self
                .consumer
                .commit(&tpl, rdkafka::consumer::CommitMode::Async)
            {
                warn!(error = %e, "Failed to commit offsets");
            }
        }
    }

    /// Settle one delivery according to the handler outcome
    async fn settle(&self, delivery: JobDelivery, outcome: Result<(), QueueError>) {
        match outcome {
            Ok(()) => {
                metrics::counter!("pipeline.queue.completed").increment(1);
            }
            Err(e) => {
                match failure_disposition(delivery.delivery_count, self.max_delivery_attempts) {
                    FailureDisposition::Abandon => {
                        debug!(
                            topic = %delivery.topic,
                            offset = delivery.offset,
                            delivery_count = delivery.delivery_count,
                            error = %e,
                            "Abandoning delivery for retry"
                        );
                        let visible_at = Utc::now()
                            + chrono::Duration::from_std(self.redelivery_delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        if let Err(send_err) = self
                            .producer
                            .requeue(
                                &delivery.topic,
                                delivery.key.clone(),
                                delivery.payload.clone(),
                                delivery.delivery_count + 1,
                                Some(visible_at),
                            )
                            .await
                        {
                            // Leave the offset unsettled: the broker will
                            // redeliver the original on restart.
                            error!(error = %send_err, "Failed to requeue abandoned delivery");
                            return;
                        }
                        metrics::counter!("pipeline.queue.abandoned").increment(1);
                    }
                    FailureDisposition::DeadLetter => {
                        warn!(
                            topic = %delivery.topic,
                            offset = delivery.offset,
                            delivery_count = delivery.delivery_count,
                            error = %e,
                            "Delivery exceeded retry budget, dead-lettering"
                        );
                        if let Err(send_err) = self
                            .producer
                            .send_to_dlq(
                                &delivery.topic,
                                &delivery.payload,
                                &e.to_string(),
                                delivery.delivery_count,
                            )
                            .await
                        {
                            error!(error = %send_err, "Failed to dead-letter delivery");
                            return;
                        }
                    }
                }
            }
        }

        self.commit_settled(delivery.partition, delivery.offset);
    }
}

/// Leased-delivery consumer for one job topic
pub struct JobConsumer {
    consumer: Arc<StreamConsumer>,
    settler: Arc<Settler>,
    config: Arc<KafkaConfig>,
    topic: String,
    slots: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobConsumer {
    /// Create a consumer for the given job topic and subscribe to it.
    ///
    /// The producer handle is owned by the caller and shared in: it serves
    /// abandon re-publishes and dead-letter sends.
    pub fn new(
        config: KafkaConfig,
        producer: Arc<PinwallProducer>,
        topic: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let topic = topic.into();

        info!(
            topic = %topic,
            group = %config.consumer.group_id,
            "Creating job consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| QueueError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[&topic])
            .map_err(|e| QueueError::SubscriptionError(e.to_string()))?;

        let consumer = Arc::new(consumer);
        let offsets = Arc::new(Mutex::new(OffsetTracker::default()));
        let (shutdown_tx, _) = broadcast::channel(1);

        let settler = Arc::new(Settler {
            consumer: consumer.clone(),
            producer,
            offsets,
            topic: topic.clone(),
            max_delivery_attempts: config.queue.max_delivery_attempts,
            redelivery_delay: config.redelivery_delay(),
        });

        let slots = Arc::new(Semaphore::new(config.consumer.max_in_flight_deliveries.max(1)));

        Ok(Self {
            consumer,
            settler,
            config: Arc::new(config),
            topic,
            slots,
            shutdown_tx,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Signal the receive loop to stop accepting deliveries
    pub fn shutdown(&self) {
        info!(topic = %self.topic, "Signaling job consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Consume and process deliveries until shutdown.
    ///
    /// The loop keeps pulling while earlier deliveries are still being
    /// processed, up to the pool capacity; settlement happens per message
    /// in the pool tasks. On shutdown no new deliveries are accepted and
    /// in-flight ones settle naturally before this returns.
    #[instrument(skip(self, handler), fields(topic = %self.topic))]
    pub async fn run<H: JobHandler>(&self, handler: Arc<H>) -> Result<(), QueueError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting job consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let delivery = convert_message(&borrowed_message);
                            {
                                let mut tracker = self
                                    .settler
                                    .offsets
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner());
                                tracker.deliver(delivery.partition, delivery.offset);
                            }
                            self.dispatch(handler.clone(), delivery).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka consumer error");
                            metrics::counter!("pipeline.queue.poll_errors").increment(1);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        // Wait for in-flight deliveries to settle before releasing the
        // consumer.
        let capacity = self.config.consumer.max_in_flight_deliveries.max(1) as u32;
        let _drain = self
            .slots
            .acquire_many(capacity)
            .await
            .map_err(|_| QueueError::Shutdown)?;

        info!("Job consumer stopped");
        Ok(())
    }

    /// Hand one delivery to the pool, deferring or re-publishing messages
    /// that are not yet visible.
    async fn dispatch<H: JobHandler>(&self, handler: Arc<H>, delivery: JobDelivery) {
        let now = Utc::now();
        let mut inline_wait = None;

        if let Some(visible_at) = delivery.visible_at {
            let remaining = (visible_at - now).to_std().unwrap_or_default();
            if remaining > self.config.max_inline_defer() {
                // Too far away to hold a pool slot: push it back on the
                // queue with its schedule intact.
                if let Err(e) = self
                    .settler
                    .producer
                    .requeue(
                        &delivery.topic,
                        delivery.key.clone(),
                        delivery.payload.clone(),
                        delivery.delivery_count,
                        Some(visible_at),
                    )
                    .await
                {
                    error!(error = %e, "Failed to re-publish deferred delivery");
                    return;
                }
                metrics::counter!("pipeline.queue.deferred").increment(1);
                self.settler
                    .commit_settled(delivery.partition, delivery.offset);
                return;
            }
            if !remaining.is_zero() {
                inline_wait = Some(remaining);
            }
        }

        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let settler = self.settler.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Some(wait) = inline_wait {
                tokio::time::sleep(wait).await;
            }
            let outcome = handler.handle(&delivery).await;
            settler.settle(delivery, outcome).await;
        });
    }
}

/// Convert a borrowed Kafka message into an owned delivery
fn convert_message<M: KafkaMessage>(msg: &M) -> JobDelivery {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg
        .key()
        .and_then(|k| String::from_utf8(k.to_vec()).ok());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    let delivery_count = headers
        .get(HEADER_DELIVERY_COUNT)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1);

    let visible_at = headers
        .get(HEADER_VISIBLE_AT)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    JobDelivery {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key,
        payload,
        delivery_count,
        visible_at,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_job_wire_format_is_pair() {
        let job = ResizeJob {
            image_id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            post_id: Uuid::parse_str("6fa459ea-ee8a-3ca4-894e-db77e160355e").unwrap(),
        };

        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(
            json,
            r#"["550e8400-e29b-41d4-a716-446655440000","6fa459ea-ee8a-3ca4-894e-db77e160355e"]"#
        );

        let decoded: ResizeJob = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_validation_job_wire_format() {
        let json = r#"{
            "contentType": "Text",
            "content": "first!",
            "commentId": "6fa459ea-ee8a-3ca4-894e-db77e160355e",
            "postId": "550e8400-e29b-41d4-a716-446655440000"
        }"#;

        let job: ValidationJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.content_type, ContentKind::Text);
        assert_eq!(job.content, "first!");
        assert!(job.comment_id.is_some());

        let round = serde_json::to_value(&job).unwrap();
        assert_eq!(round["contentType"], "Text");
        assert_eq!(round["postId"], job.post_id.to_string());
    }

    #[test]
    fn test_failure_disposition_threshold() {
        let max = 5;
        // deliveries 1..=5 are retried
        for count in 1..=5 {
            assert_eq!(failure_disposition(count, max), FailureDisposition::Abandon);
        }
        // the 6th failed delivery is terminal, there is no 7th attempt
        assert_eq!(failure_disposition(6, max), FailureDisposition::DeadLetter);
        assert_eq!(failure_disposition(7, max), FailureDisposition::DeadLetter);
    }

    #[test]
    fn test_offset_tracker_in_order() {
        let mut tracker = OffsetTracker::default();
        tracker.deliver(0, 10);
        tracker.deliver(0, 11);

        assert_eq!(tracker.settle(0, 10), Some(11));
        assert_eq!(tracker.settle(0, 11), Some(12));
    }

    #[test]
    fn test_offset_tracker_holds_gap() {
        let mut tracker = OffsetTracker::default();
        tracker.deliver(0, 10);
        tracker.deliver(0, 11);
        tracker.deliver(0, 12);

        // A later delivery settling first must not advance the commit
        // position past the in-flight one.
        assert_eq!(tracker.settle(0, 12), None);
        assert_eq!(tracker.settle(0, 11), None);
        assert_eq!(tracker.settle(0, 10), Some(13));
    }

    #[test]
    fn test_offset_tracker_partitions_are_independent() {
        let mut tracker = OffsetTracker::default();
        tracker.deliver(0, 5);
        tracker.deliver(1, 40);

        assert_eq!(tracker.settle(1, 40), Some(41));
        assert_eq!(tracker.settle(0, 5), Some(6));
    }

    #[test]
    fn test_offset_tracker_rewind_resets_watermark() {
        let mut tracker = OffsetTracker::default();
        tracker.deliver(0, 10);
        assert_eq!(tracker.settle(0, 10), Some(11));

        // rebalance redelivers an earlier offset
        tracker.deliver(0, 8);
        assert_eq!(tracker.settle(0, 8), Some(9));
    }

    #[test]
    fn test_delivery_defaults() {
        let delivery = JobDelivery {
            topic: "jobs".into(),
            partition: 0,
            offset: 1,
            key: None,
            payload: br#"["550e8400-e29b-41d4-a716-446655440000","6fa459ea-ee8a-3ca4-894e-db77e160355e"]"#.to_vec(),
            delivery_count: 1,
            visible_at: None,
            headers: HashMap::new(),
        };

        let job: ResizeJob = delivery.decode_json().unwrap();
        assert_eq!(
            job.post_id.to_string(),
            "6fa459ea-ee8a-3ca4-894e-db77e160355e"
        );
    }
}
