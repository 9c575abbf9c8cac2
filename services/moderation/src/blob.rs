use crate::config::BlobConfig;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Blob store with an unvalidated and a validated bucket.
///
/// Moderated images move between the two via upload-then-delete; there is
/// no atomic move, so a blob can briefly be present in both buckets and,
/// on the unlucky interleaving, found in neither by a reader that only
/// checks one.
pub struct BlobStore {
    client: S3Client,
    unvalidated: String,
    validated: String,
    public_base_url: String,
}

impl BlobStore {
    /// Create a new blob store client
    pub async fn new(config: &BlobConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            unvalidated = %config.unvalidated_bucket,
            validated = %config.validated_bucket,
            region = %config.region,
            "Blob store initialized"
        );

        Ok(Self {
            client,
            unvalidated: config.unvalidated_bucket.clone(),
            validated: config.validated_bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Download an image awaiting moderation
    #[instrument(skip(self), fields(image_id = %image_id))]
    pub async fn download_unvalidated(&self, image_id: Uuid) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.unvalidated)
            .key(image_id.to_string())
            .send()
            .await
            .context("Failed to download unvalidated blob")?;

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to read blob body")?
            .into_bytes()
            .to_vec();

        debug!(size_bytes = bytes.len(), "Blob downloaded");
        Ok(bytes)
    }

    /// Upload moderated image bytes to the validated bucket and return the
    /// public URL
    #[instrument(skip(self, bytes), fields(image_id = %image_id, size_bytes = bytes.len()))]
    pub async fn promote(&self, image_id: Uuid, bytes: Vec<u8>) -> Result<String> {
        self.client
            .put_object()
            .bucket(&self.validated)
            .key(image_id.to_string())
            .body(ByteStream::from(bytes))
            .content_type("application/octet-stream")
            .send()
            .await
            .context("Failed to upload blob to validated bucket")?;

        Ok(self.validated_url(image_id))
    }

    /// Delete an image from the unvalidated bucket
    #[instrument(skip(self), fields(image_id = %image_id))]
    pub async fn delete_unvalidated(&self, image_id: Uuid) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.unvalidated)
            .key(image_id.to_string())
            .send()
            .await
            .context("Failed to delete blob from unvalidated bucket")?;

        debug!("Blob deleted from unvalidated bucket");
        Ok(())
    }

    /// Public URL of a blob in the validated bucket
    pub fn validated_url(&self, image_id: Uuid) -> String {
        object_url(&self.public_base_url, &self.validated, image_id)
    }
}

/// Public URL of one object in one bucket
fn object_url(base: &str, bucket: &str, image_id: Uuid) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, image_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_shape() {
        let image_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            object_url("http://localhost:9000/", "validated", image_id),
            "http://localhost:9000/validated/550e8400-e29b-41d4-a716-446655440000"
        );
    }
}
