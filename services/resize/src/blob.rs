use crate::config::BlobConfig;
use anyhow::{anyhow, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Which bucket a blob was found in.
///
/// Moderation moves images from the unvalidated to the validated bucket
/// with an upload-then-delete, so by the time a resize job runs its blob
/// can be on either side of the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketSlot {
    Unvalidated,
    Validated,
}

/// Blob access for the resize worker: locate, download, upload in place
pub struct ImageStore {
    client: S3Client,
    unvalidated: String,
    validated: String,
}

impl ImageStore {
    /// Create a new image store client
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
            "Image store initialized"
        );

        Ok(Self {
            client,
            unvalidated: config.unvalidated_bucket.clone(),
            validated: config.validated_bucket.clone(),
        })
    }

    fn bucket(&self, slot: BucketSlot) -> &str {
        match slot {
            BucketSlot::Unvalidated => &self.unvalidated,
            BucketSlot::Validated => &self.validated,
        }
    }

    /// Find which bucket currently holds the image: the unvalidated bucket
    /// first, then the validated one. Absent from both is an error the
    /// delivery policy turns into retries and eventually a dead letter.
    #[instrument(skip(self), fields(image_id = %image_id))]
    pub async fn locate(&self, image_id: Uuid) -> Result<BucketSlot> {
        if self.exists(BucketSlot::Unvalidated, image_id).await? {
            return Ok(BucketSlot::Unvalidated);
        }
        if self.exists(BucketSlot::Validated, image_id).await? {
            return Ok(BucketSlot::Validated);
        }
        Err(anyhow!("image {image_id} not found in either bucket"))
    }

    async fn exists(&self, slot: BucketSlot, image_id: Uuid) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(self.bucket(slot))
            .key(image_id.to_string())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e).context("Failed to check image existence")
                }
            }
        }
    }

    /// Download image bytes from the given bucket
    #[instrument(skip(self), fields(image_id = %image_id, slot = ?slot))]
    pub async fn download(&self, slot: BucketSlot, image_id: Uuid) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(self.bucket(slot))
            .key(image_id.to_string())
            .send()
            .await
            .context("Failed to download image")?;

        let bytes = response
            .body
            .collect()
            .await
            .context("Failed to read image body")?
            .into_bytes()
            .to_vec();

        debug!(size_bytes = bytes.len(), "Image downloaded");
        Ok(bytes)
    }

    /// Upload transformed bytes back to the same bucket the image came
    /// from
    #[instrument(skip(self, bytes), fields(image_id = %image_id, slot = ?slot, size_bytes = bytes.len()))]
    pub async fn upload(&self, slot: BucketSlot, image_id: Uuid, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket(slot))
            .key(image_id.to_string())
            .body(ByteStream::from(bytes))
            .content_type("image/png")
            .send()
            .await
            .context("Failed to upload resized image")?;

        debug!("Resized image uploaded");
        Ok(())
    }
}
