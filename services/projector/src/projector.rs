//! Folds the event log into the read model.
//!
//! Projection happens in two steps: [`project`] turns one event into a
//! deterministic plan against the store, and the [`Projector`] executes
//! that plan with a bounded retry for targets that are not visible yet.
//! Keeping the decision pure makes every transition of the state machine
//! testable without a database.

use crate::config::{BlobUrlConfig, RetryConfig};
use crate::store::{CommentField, NewComment, NewPost, PostField, ReadStore, StoreError};
use pinwall_pipeline::consumer::{ConsumerError, EventHandler};
use pinwall_pipeline::event::{Event, EventAction, MediaType};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

/// Title given to records materialized from the log; the authoring web
/// tier owns the real title and fills it in through its own store writes
pub const PLACEHOLDER_TITLE: &str = "(untitled)";
/// Author recorded on materialized records
pub const PLACEHOLDER_AUTHOR: &str = "system";

/// Errors turning an event into a plan or applying it
#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Target {id} still missing after {attempts} attempts")]
    TargetNeverAppeared { id: Uuid, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One read-model operation derived from an event
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    CreatePost(NewPost),
    CreateComment(NewComment),
    PatchPost {
        post_id: Uuid,
        fields: Vec<PostField>,
    },
    PatchComment {
        comment_id: Uuid,
        post_id: Uuid,
        fields: Vec<CommentField>,
    },
    DeletePost {
        post_id: Uuid,
    },
    DeleteComment {
        comment_id: Uuid,
        post_id: Uuid,
    },
    /// Audit-only event with no read-model effect
    Ignore,
}

/// URL arithmetic for materialized posts
#[derive(Debug, Clone)]
pub struct UrlScheme {
    base: String,
    unvalidated_bucket: String,
    validated_bucket: String,
}

impl UrlScheme {
    pub fn new(config: &BlobUrlConfig) -> Self {
        Self {
            base: config.public_base_url.trim_end_matches('/').to_string(),
            unvalidated_bucket: config.unvalidated_bucket.clone(),
            validated_bucket: config.validated_bucket.clone(),
        }
    }

    /// URL of a blob still awaiting its verdict
    pub fn unvalidated(&self, blob: &str) -> String {
        format!("{}/{}/{}", self.base, self.unvalidated_bucket, blob)
    }

    /// URL of a blob that passed through moderation
    pub fn validated(&self, blob: &str) -> String {
        format!("{}/{}/{}", self.base, self.validated_bucket, blob)
    }
}

/// Decide what one event does to the read model.
///
/// The full transition table, keyed by `(action, media_type)`:
/// Submitted creates a pending record, Validated/Refused patch the
/// approval flag (and the URL for validated posts), Deleted removes the
/// record, and Resized/Processed are audit signals with no effect.
pub fn project(event: &Event, urls: &UrlScheme) -> Result<Projection, ProjectionError> {
    let projection = match (event.action, event.media_type) {
        (EventAction::Submitted, MediaType::Image) => Projection::CreatePost(NewPost {
            post_id: event.post_id,
            title: PLACEHOLDER_TITLE.to_string(),
            author: PLACEHOLDER_AUTHOR.to_string(),
            blob_image: event.data.clone(),
            url: urls.unvalidated(&event.data),
        }),

        (EventAction::Submitted, MediaType::Text) => Projection::CreateComment(NewComment {
            comment_id: require_comment_id(event)?,
            post_id: event.post_id,
            content: event.data.clone(),
            author: PLACEHOLDER_AUTHOR.to_string(),
        }),

        (EventAction::Validated, MediaType::Image) => Projection::PatchPost {
            post_id: event.post_id,
            fields: vec![
                PostField::IsApproved(Some(true)),
                PostField::Url(urls.validated(&event.data)),
            ],
        },

        (EventAction::Refused, MediaType::Image) => Projection::PatchPost {
            post_id: event.post_id,
            fields: vec![PostField::IsApproved(Some(false))],
        },

        (EventAction::Validated, MediaType::Text) => Projection::PatchComment {
            comment_id: require_comment_id(event)?,
            post_id: event.post_id,
            fields: vec![CommentField::IsApproved(Some(true))],
        },

        (EventAction::Refused, MediaType::Text) => Projection::PatchComment {
            comment_id: require_comment_id(event)?,
            post_id: event.post_id,
            fields: vec![CommentField::IsApproved(Some(false))],
        },

        (EventAction::Deleted, MediaType::Image) => Projection::DeletePost {
            post_id: event.post_id,
        },

        (EventAction::Deleted, MediaType::Text) => Projection::DeleteComment {
            comment_id: require_comment_id(event)?,
            post_id: event.post_id,
        },

        (EventAction::Resized | EventAction::Processed, _) => Projection::Ignore,
    };

    Ok(projection)
}

fn require_comment_id(event: &Event) -> Result<Uuid, ProjectionError> {
    event.comment_id.ok_or_else(|| {
        ProjectionError::MalformedEvent(format!(
            "{:?} text event for post {} without comment id",
            event.action, event.post_id
        ))
    })
}

/// Applies projected operations to the read store
pub struct Projector {
    store: ReadStore,
    urls: UrlScheme,
    retry: RetryConfig,
}

impl Projector {
    pub fn new(store: ReadStore, urls: UrlScheme, retry: RetryConfig) -> Self {
        Self { store, urls, retry }
    }

    /// Execute one plan, retrying patches whose target has not been
    /// created yet.
    ///
    /// Events for one post are partition-ordered, but the create may still
    /// be in flight (producer latency skew) or this patch may have been
    /// redelivered from before a rebalance. The retry is a fixed delay
    /// with a finite ceiling; running out surfaces a terminal error so the
    /// event is dead-lettered rather than silently dropped or waited on
    /// forever.
    #[instrument(skip(self, projection))]
    async fn execute(&self, projection: Projection) -> Result<(), ProjectionError> {
        match projection {
            Projection::CreatePost(post) => {
                self.store.create_post(&post).await?;
            }
            Projection::CreateComment(comment) => {
                self.store.create_comment(&comment).await?;
            }
            Projection::PatchPost { post_id, fields } => {
                self.patch_with_retry(post_id, || self.store.patch_post(post_id, &fields))
                    .await?;
            }
            Projection::PatchComment {
                comment_id,
                post_id,
                fields,
            } => {
                self.patch_with_retry(comment_id, || {
                    self.store.patch_comment(comment_id, post_id, &fields)
                })
                .await?;
            }
            Projection::DeletePost { post_id } => {
                self.store.delete_post(post_id).await?;
            }
            Projection::DeleteComment {
                comment_id,
                post_id,
            } => {
                self.store.delete_comment(comment_id, post_id).await?;
            }
            Projection::Ignore => {
                trace!("Audit-only event, no read model effect");
            }
        }
        Ok(())
    }

    async fn patch_with_retry<F, Fut>(&self, id: Uuid, operation: F) -> Result<(), ProjectionError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        retry_until_created(
            id,
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
            operation,
        )
        .await
    }
}

/// Retry an operation until its target record exists or the attempt
/// ceiling is reached.
///
/// Only the distinguishable not-found error is retried; anything else
/// surfaces immediately. Exhausting the ceiling yields a terminal
/// [`ProjectionError::TargetNeverAppeared`].
async fn retry_until_created<F, Fut>(
    id: Uuid,
    max_attempts: u32,
    delay: Duration,
    operation: F,
) -> Result<(), ProjectionError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let max_attempts = max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                if attempt >= max_attempts {
                    metrics::counter!("projector.patches.expired").increment(1);
                    return Err(ProjectionError::TargetNeverAppeared {
                        id,
                        attempts: attempt,
                    });
                }
                warn!(
                    id = %id,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    "Patch target not created yet, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for Projector {
    async fn apply(&self, event: Event) -> Result<(), ConsumerError> {
        debug!(
            action = ?event.action,
            media_type = ?event.media_type,
            post_id = %event.post_id,
            "Applying event"
        );

        let projection = project(&event, &self.urls)
            .map_err(|e| ConsumerError::ApplyError(e.to_string()))?;

        self.execute(projection)
            .await
            .map_err(|e| ConsumerError::ApplyError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> UrlScheme {
        UrlScheme::new(&BlobUrlConfig {
            public_base_url: "http://blobs.local".into(),
            unvalidated_bucket: "unvalidated".into(),
            validated_bucket: "validated".into(),
        })
    }

    fn post_id() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    fn comment_id() -> Uuid {
        Uuid::parse_str("6fa459ea-ee8a-3ca4-894e-db77e160355e").unwrap()
    }

    #[test]
    fn test_submitted_image_creates_pending_post() {
        let image_id = Uuid::new_v4();
        let event = Event::submitted_post(post_id(), image_id);

        let projection = project(&event, &urls()).unwrap();
        assert_eq!(
            projection,
            Projection::CreatePost(NewPost {
                post_id: post_id(),
                title: PLACEHOLDER_TITLE.to_string(),
                author: PLACEHOLDER_AUTHOR.to_string(),
                blob_image: image_id.to_string(),
                url: format!("http://blobs.local/unvalidated/{image_id}"),
            })
        );
    }

    #[test]
    fn test_submitted_text_creates_pending_comment() {
        let event = Event::submitted_comment(post_id(), comment_id(), "first!");

        let projection = project(&event, &urls()).unwrap();
        assert_eq!(
            projection,
            Projection::CreateComment(NewComment {
                comment_id: comment_id(),
                post_id: post_id(),
                content: "first!".to_string(),
                author: PLACEHOLDER_AUTHOR.to_string(),
            })
        );
    }

    #[test]
    fn test_validated_image_patches_approval_and_url() {
        let image_id = Uuid::new_v4();
        let event = Event::verdict(post_id(), None, image_id.to_string(), true);

        let projection = project(&event, &urls()).unwrap();
        assert_eq!(
            projection,
            Projection::PatchPost {
                post_id: post_id(),
                fields: vec![
                    PostField::IsApproved(Some(true)),
                    PostField::Url(format!("http://blobs.local/validated/{image_id}")),
                ],
            }
        );
    }

    #[test]
    fn test_refused_image_patches_approval_only() {
        let event = Event::verdict(post_id(), None, "blob", false);

        let projection = project(&event, &urls()).unwrap();
        assert_eq!(
            projection,
            Projection::PatchPost {
                post_id: post_id(),
                fields: vec![PostField::IsApproved(Some(false))],
            }
        );
    }

    #[test]
    fn test_comment_verdicts_patch_approval() {
        for (approved, expected) in [(true, Some(true)), (false, Some(false))] {
            let event = Event::verdict(post_id(), Some(comment_id()), "text", approved);
            let projection = project(&event, &urls()).unwrap();
            assert_eq!(
                projection,
                Projection::PatchComment {
                    comment_id: comment_id(),
                    post_id: post_id(),
                    fields: vec![CommentField::IsApproved(expected)],
                }
            );
        }
    }

    #[test]
    fn test_deleted_events_remove_records() {
        let event = Event::post_deleted(post_id());
        assert_eq!(
            project(&event, &urls()).unwrap(),
            Projection::DeletePost { post_id: post_id() }
        );

        let event = Event::comment_deleted(post_id(), comment_id());
        assert_eq!(
            project(&event, &urls()).unwrap(),
            Projection::DeleteComment {
                comment_id: comment_id(),
                post_id: post_id(),
            }
        );
    }

    #[test]
    fn test_processed_and_resized_are_audit_only() {
        let event = Event::image_processed(post_id(), Uuid::new_v4());
        assert_eq!(project(&event, &urls()).unwrap(), Projection::Ignore);

        let resized = event.transformed(MediaType::Image, EventAction::Resized);
        assert_eq!(project(&resized, &urls()).unwrap(), Projection::Ignore);
    }

    #[test]
    fn test_text_event_without_comment_id_is_malformed() {
        let mut event = Event::submitted_comment(post_id(), comment_id(), "hello");
        event.comment_id = None;

        assert!(matches!(
            project(&event, &urls()),
            Err(ProjectionError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_projection_is_deterministic() {
        // Replaying the same event must plan the same operation; combined
        // with create-if-absent / absolute patches / delete-if-present in
        // the store this makes the whole apply idempotent.
        let event = Event::verdict(post_id(), Some(comment_id()), "text", true);
        let first = project(&event, &urls()).unwrap();
        let second = project(&event, &urls()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_retry_waits_for_create_then_applies() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = AtomicU32::new(0);

        let result = retry_until_created(post_id(), 5, Duration::from_millis(1), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::TargetMissing {
                    entity: "post",
                    id: post_id(),
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
    async fn test_retry_ceiling_is_finite_and_terminal() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = AtomicU32::new(0);

        let result = retry_until_created(post_id(), 4, Duration::from_millis(1), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::TargetMissing {
                entity: "comment",
                id: comment_id(),
            })
        })
        .await;

        assert!(matches!(
            result,
            Err(ProjectionError::TargetNeverAppeared { attempts: 4, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_does_not_mask_other_store_errors() {
        let result = retry_until_created(post_id(), 5, Duration::from_millis(1), || async {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        })
        .await;

        assert!(matches!(result, Err(ProjectionError::Store(_))));
    }
}
