use crate::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from verdict writes.
///
/// `TargetMissing` is the distinguishable, retryable case: the projector
/// has not made the record visible yet and the caller may try again.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Target {entity} {id} not found")]
    TargetMissing { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Writes safety verdicts into the read store.
///
/// Both this direct path and the projector's event-driven path patch the
/// same fields with absolute values, so the two writes converge to the
/// same document no matter how they interleave or repeat.
pub struct VerdictStore {
    pool: PgPool,
}

impl VerdictStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!("Connected to read store");

        Ok(Self { pool })
    }

    /// Record a post verdict: approval flag plus the validated URL
    #[instrument(skip(self), fields(post_id = %post_id, approved = approved))]
    pub async fn apply_post_verdict(
        &self,
        post_id: Uuid,
        approved: bool,
        url: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET is_approved = $2, url = $3
            WHERE id = $1 AND post_id = $1
            "#,
        )
        .bind(post_id)
        .bind(approved)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TargetMissing {
                entity: "post",
                id: post_id,
            });
        }

        debug!("Post verdict recorded");
        metrics::counter!("moderation.verdicts.posts").increment(1);
        Ok(())
    }

    /// Record a comment verdict: approval flag plus the moderated content
    #[instrument(skip(self, content), fields(comment_id = %comment_id, approved = approved))]
    pub async fn apply_comment_verdict(
        &self,
        comment_id: Uuid,
        post_id: Uuid,
        approved: bool,
        content: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE comments
            SET is_approved = $3, content = $4
            WHERE id = $1 AND post_id = $2
            "#,
        )
        .bind(comment_id)
        .bind(post_id)
        .bind(approved)
        .bind(content)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TargetMissing {
                entity: "comment",
                id: comment_id,
            });
        }

        debug!("Comment verdict recorded");
        metrics::counter!("moderation.verdicts.comments").increment(1);
        Ok(())
    }

    /// Whether an error means the target may appear later
    pub fn is_retryable(error: &StoreError) -> bool {
        matches!(error, StoreError::TargetMissing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_missing_is_retryable() {
        let error = StoreError::TargetMissing {
            entity: "post",
            id: Uuid::new_v4(),
        };
        assert!(VerdictStore::is_retryable(&error));
        assert!(!VerdictStore::is_retryable(&StoreError::Database(
            sqlx::Error::PoolClosed
        )));
    }
}
