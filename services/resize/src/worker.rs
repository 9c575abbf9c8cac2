use crate::blob::ImageStore;
use crate::config::ResizeConfig;
use crate::resizer;
use anyhow::Result;
use pinwall_pipeline::event::Event;
use pinwall_pipeline::producer::PinwallProducer;
use pinwall_pipeline::queue::{JobDelivery, JobHandler, QueueError, ResizeJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, instrument};

/// Worker consuming resize jobs and rewriting image blobs in place.
///
/// Transforms run behind a semaphore wider than the moderation worker's:
/// resizing is bounded by local CPU and blob I/O, not by an external rate
/// limit.
pub struct ResizeWorker {
    images: ImageStore,
    events: Arc<PinwallProducer>,
    transform_slots: Arc<Semaphore>,
    target_width: u32,
    min_processing_latency: Duration,
}

impl ResizeWorker {
    pub fn new(images: ImageStore, events: Arc<PinwallProducer>, config: &ResizeConfig) -> Self {
        Self {
            images,
            events,
            transform_slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            target_width: config.target_width,
            min_processing_latency: Duration::from_millis(config.min_processing_ms),
        }
    }

    /// Resize one image: locate it (it may already have moved to the
    /// validated bucket), transform, write back to the same place, record
    /// the Processed event.
    #[instrument(skip(self, job), fields(post_id = %job.post_id, image_id = %job.image_id))]
    async fn process(&self, job: &ResizeJob) -> Result<()> {
        let started = Instant::now();

        let slot = self.images.locate(job.image_id).await?;
        let original = self.images.download(slot, job.image_id).await?;

        let resized = resizer::resize_to_width(&original, self.target_width)?;

        // Hold the floor on processing time before publishing the result
        let elapsed = started.elapsed();
        if elapsed < self.min_processing_latency {
            tokio::time::sleep(self.min_processing_latency - elapsed).await;
        }

        self.images.upload(slot, job.image_id, resized).await?;

        self.events
            .publish_event(&Event::image_processed(job.post_id, job.image_id))
            .await?;

        info!(slot = ?slot, "Image resized");
        metrics::counter!("resize.jobs.completed").increment(1);
        metrics::counter!("resize.bytes.read").increment(original.len() as u64);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for ResizeWorker {
    async fn handle(&self, delivery: &JobDelivery) -> Result<(), QueueError> {
        let job: ResizeJob = delivery.decode_json()?;

        let _slot = self
            .transform_slots
            .acquire()
            .await
            .map_err(|_| QueueError::Shutdown)?;

        self.process(&job)
            .await
            .map_err(|e| QueueError::ProcessingError(format!("{e:#}")))
    }
}
