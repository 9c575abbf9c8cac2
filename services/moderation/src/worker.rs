use crate::blob::BlobStore;
use crate::config::RetryConfig;
use crate::safety::SafetyClient;
use crate::store::{StoreError, VerdictStore};
use anyhow::{anyhow, Context, Result};
use pinwall_pipeline::event::Event;
use pinwall_pipeline::producer::PinwallProducer;
use pinwall_pipeline::queue::{ContentKind, JobDelivery, JobHandler, QueueError, ValidationJob};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Worker consuming validation jobs and recording safety verdicts.
///
/// The semaphore throttles safety-analysis calls, not deliveries: the
/// queue consumer may hold more messages in flight than analysis slots
/// exist, and the effective concurrency is the smaller of the two bounds.
pub struct ModerationWorker {
    safety: SafetyClient,
    blobs: BlobStore,
    store: VerdictStore,
    events: Arc<PinwallProducer>,
    analysis_slots: Arc<Semaphore>,
    retry: RetryConfig,
}

impl ModerationWorker {
    pub fn new(
        safety: SafetyClient,
        blobs: BlobStore,
        store: VerdictStore,
        events: Arc<PinwallProducer>,
        max_concurrent: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            safety,
            blobs,
            store,
            events,
            analysis_slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
        }
    }

    /// Moderate a text comment
    #[instrument(skip(self, job), fields(post_id = %job.post_id))]
    async fn moderate_text(&self, job: &ValidationJob) -> Result<()> {
        let comment_id = job
            .comment_id
            .ok_or_else(|| anyhow!("text validation job without comment id"))?;

        let safe = self.safety.analyze_text(&job.content).await?;

        with_target_retry(self.retry.max_attempts, self.retry_delay(), || {
            self.store
                .apply_comment_verdict(comment_id, job.post_id, safe, &job.content)
        })
        .await
        .context("Failed to record comment verdict")?;

        self.events
            .publish_event(&Event::verdict(
                job.post_id,
                Some(comment_id),
                job.content.clone(),
                safe,
            ))
            .await?;

        info!(comment_id = %comment_id, safe = safe, "Comment moderated");
        metrics::counter!("moderation.jobs.text").increment(1);
        if !safe {
            metrics::counter!("moderation.verdicts.refused").increment(1);
        }
        Ok(())
    }

    /// Moderate an image post.
    ///
    /// The blob moves to the validated bucket whichever way the verdict
    /// goes; refused posts keep their record flagged and are never served.
    #[instrument(skip(self, job), fields(post_id = %job.post_id))]
    async fn moderate_image(&self, job: &ValidationJob) -> Result<()> {
        let image_id: Uuid = job
            .content
            .parse()
            .map_err(|_| anyhow!("image validation job with non-uuid content: {}", job.content))?;

        let bytes = self.blobs.download_unvalidated(image_id).await?;
        let safe = self.safety.analyze_image(&bytes).await?;
        let url = self.blobs.promote(image_id, bytes).await?;

        with_target_retry(self.retry.max_attempts, self.retry_delay(), || {
            self.store.apply_post_verdict(job.post_id, safe, &url)
        })
        .await
        .context("Failed to record post verdict")?;

        self.blobs.delete_unvalidated(image_id).await?;

        self.events
            .publish_event(&Event::verdict(
                job.post_id,
                None,
                image_id.to_string(),
                safe,
            ))
            .await?;

        info!(image_id = %image_id, safe = safe, "Image moderated");
        metrics::counter!("moderation.jobs.image").increment(1);
        if !safe {
            metrics::counter!("moderation.verdicts.refused").increment(1);
        }
        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}

#[async_trait::async_trait]
impl JobHandler for ModerationWorker {
    async fn handle(&self, delivery: &JobDelivery) -> Result<(), QueueError> {
        let job: ValidationJob = delivery.decode_json()?;

        let _slot = self
            .analysis_slots
            .acquire()
            .await
            .map_err(|_| QueueError::Shutdown)?;

        let outcome = match job.content_type {
            ContentKind::Text => self.moderate_text(&job).await,
            ContentKind::Image => self.moderate_image(&job).await,
        };

        outcome.map_err(|e| QueueError::ProcessingError(format!("{e:#}")))
    }
}

/// Retry an operation whose target may not exist yet.
///
/// The projector creates read-model records from the event log, so a
/// verdict write can race ahead of the create. Missing targets are retried
/// with a fixed delay up to `max_attempts`; any other error, and the last
/// missing-target error, surface immediately.
async fn with_target_retry<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    operation: F,
) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Err(e) if VerdictStore::is_retryable(&e) && attempt < max_attempts => {
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Verdict target not visible yet, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn missing(attempts: &AtomicU32) -> Result<(), StoreError> {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::TargetMissing {
            entity: "post",
            id: Uuid::new_v4(),
        })
    }

    #[tokio::test]
    async fn test_target_retry_is_bounded() {
        let attempts = AtomicU32::new(0);

        let result = with_target_retry(3, Duration::from_millis(1), || async {
            missing(&attempts)
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_target_retry_succeeds_once_target_appears() {
        let attempts = AtomicU32::new(0);

        let result = with_target_retry(5, Duration::from_millis(1), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::TargetMissing {
                    entity: "comment",
                    id: Uuid::new_v4(),
                })
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_target_retry_does_not_retry_other_errors() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), StoreError> =
            with_target_retry(5, Duration::from_millis(1), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Database(sqlx::Error::PoolClosed))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
