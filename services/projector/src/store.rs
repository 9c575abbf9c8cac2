use crate::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from read-model writes.
///
/// `TargetMissing` is the distinguishable retryable case: a patch arrived
/// before the create it depends on was applied.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Target {entity} {id} not found")]
    TargetMissing { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the target may still appear later
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TargetMissing { .. })
    }
}

/// Typed patch descriptor for a post record
#[derive(Debug, Clone, PartialEq)]
pub enum PostField {
    IsApproved(Option<bool>),
    Url(String),
}

/// Typed patch descriptor for a comment record
#[derive(Debug, Clone, PartialEq)]
pub enum CommentField {
    IsApproved(Option<bool>),
    Content(String),
}

/// A post record to materialize from a Submitted event
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub post_id: Uuid,
    pub title: String,
    pub author: String,
    pub blob_image: String,
    pub url: String,
}

/// A comment record to materialize from a Submitted event
#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub comment_id: Uuid,
    pub post_id: Uuid,
    pub content: String,
    pub author: String,
}

/// Read-model repository: Posts and Comments, partitioned by post id.
///
/// Creates are create-if-absent, patches overwrite with absolute values
/// and deletes are delete-if-present, so replaying any event is a no-op
/// once its effect is in place.
pub struct ReadStore {
    pool: PgPool,
}

impl ReadStore {
    /// Create a new read store with a connection pool
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

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running read model migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(sqlx::Error::from(e)))?;

        info!("Read model migrations completed");
        Ok(())
    }

    /// Materialize a pending post record; a record that already exists is
    /// left untouched
    #[instrument(skip(self, post), fields(post_id = %post.post_id))]
    pub async fn create_post(&self, post: &NewPost) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (id, post_id, title, author, is_approved, blob_image, url)
            VALUES ($1, $1, $2, $3, NULL, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(post.post_id)
        .bind(&post.title)
        .bind(&post.author)
        .bind(&post.blob_image)
        .bind(&post.url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Post already materialized");
        }
        metrics::counter!("projector.posts.created").increment(1);
        Ok(())
    }

    /// Materialize a pending comment record; create-if-absent like posts
    #[instrument(skip(self, comment), fields(comment_id = %comment.comment_id))]
    pub async fn create_comment(&self, comment: &NewComment) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO comments (id, post_id, content, author, is_approved)
            VALUES ($1, $2, $3, $4, NULL)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(comment.comment_id)
        .bind(comment.post_id)
        .bind(&comment.content)
        .bind(&comment.author)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Comment already materialized");
        }
        metrics::counter!("projector.comments.created").increment(1);
        Ok(())
    }

    /// Patch a post with absolute field values
    #[instrument(skip(self, fields), fields(post_id = %post_id))]
    pub async fn patch_post(&self, post_id: Uuid, fields: &[PostField]) -> Result<(), StoreError> {
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let placeholder = i + 2;
                match field {
                    PostField::IsApproved(_) => format!("is_approved = ${placeholder}"),
                    PostField::Url(_) => format!("url = ${placeholder}"),
                }
            })
            .collect();

        let sql = format!(
            "UPDATE posts SET {} WHERE id = $1 AND post_id = $1",
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(post_id);
        for field in fields {
            query = match field {
                PostField::IsApproved(value) => query.bind(*value),
                PostField::Url(url) => query.bind(url),
            };
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TargetMissing {
                entity: "post",
                id: post_id,
            });
        }

        metrics::counter!("projector.posts.patched").increment(1);
        Ok(())
    }

    /// Patch a comment with absolute field values
    #[instrument(skip(self, fields), fields(comment_id = %comment_id))]
    pub async fn patch_comment(
        &self,
        comment_id: Uuid,
        post_id: Uuid,
        fields: &[CommentField],
    ) -> Result<(), StoreError> {
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let placeholder = i + 3;
                match field {
                    CommentField::IsApproved(_) => format!("is_approved = ${placeholder}"),
                    CommentField::Content(_) => format!("content = ${placeholder}"),
                }
            })
            .collect();

        let sql = format!(
            "UPDATE comments SET {} WHERE id = $1 AND post_id = $2",
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(comment_id).bind(post_id);
        for field in fields {
            query = match field {
                CommentField::IsApproved(value) => query.bind(*value),
                CommentField::Content(content) => query.bind(content),
            };
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TargetMissing {
                entity: "comment",
                id: comment_id,
            });
        }

        metrics::counter!("projector.comments.patched").increment(1);
        Ok(())
    }

    /// Remove a post record; deleting an absent record is a no-op so the
    /// same Deleted event can be replayed safely
    #[instrument(skip(self), fields(post_id = %post_id))]
    pub async fn delete_post(&self, post_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1 AND post_id = $1")
            .bind(post_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            metrics::counter!("projector.posts.deleted").increment(1);
        } else {
            debug!("Post already absent");
        }
        Ok(deleted)
    }

    /// Remove a comment record, delete-if-present like posts
    #[instrument(skip(self), fields(comment_id = %comment_id))]
    pub async fn delete_comment(&self, comment_id: Uuid, post_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM comments WHERE id = $1 AND post_id = $2")
            .bind(comment_id)
            .bind(post_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            metrics::counter!("projector.comments.deleted").increment(1);
        } else {
            debug!("Comment already absent");
        }
        Ok(deleted)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_missing_is_retryable() {
        let missing = StoreError::TargetMissing {
            entity: "post",
            id: Uuid::new_v4(),
        };
        assert!(missing.is_retryable());
        assert!(!StoreError::Database(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn test_post_patch_descriptors_are_typed() {
        let fields = vec![
            PostField::IsApproved(Some(true)),
            PostField::Url("http://example/validated/x".into()),
        ];
        assert_eq!(fields[0], PostField::IsApproved(Some(true)));
        assert_ne!(fields[0], PostField::IsApproved(Some(false)));
    }
}
