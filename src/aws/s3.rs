// file: src/aws/s3.rs
// version: 1.0.0
// guid: 8b4e2a6c-0d1f-4e93-a7b5-9c0d1e2f3a4b

//! S3 bucket lookup and object upload

use super::client::AwsClient;
use crate::error::CloudImagesError;
use crate::network::http::HttpRequest;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Largest object a single PUT accepts
pub const MAX_PUT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Region used to sign requests whose region is not known yet
pub const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Client {
    client: Arc<AwsClient>,
}

impl S3Client {
    pub fn new(client: Arc<AwsClient>) -> Self {
        Self { client }
    }

    /// Region of a bucket, from `x-amz-bucket-region`.
    ///
    /// S3 sends the header on redirects and access errors as well.
    pub async fn bucket_region(&self, bucket: &str) -> Result<String> {
        let request = HttpRequest::head(self.client.s3_url(bucket, None, ""));
        let response = self.client.send_raw(request, "s3", DEFAULT_REGION).await?;
        if let Some(region) = response.header("x-amz-bucket-region") {
            return Ok(region.to_string());
        }
        response.error_for_status(&format!("HEAD bucket {}", bucket))?;
        Err(CloudImagesError::RemoteError {
            status: 200,
            message: format!("Bucket {} did not report its region", bucket),
        })
    }

    /// Stream a file into `key`
    pub async fn put_object(&self, region: &str, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_PUT_SIZE {
            return Err(CloudImagesError::precondition(format!(
                "{} is {} bytes, more than a single upload allows",
                path.display(),
                size
            )));
        }

        info!("Uploading {} to s3://{}/{} ({} bytes)", path.display(), bucket, key, size);
        let request = HttpRequest::put(self.client.s3_url(bucket, Some(region), key)).file(path, 0, size);
        self.client.send(request, "s3", region).await?;
        Ok(())
    }

    pub async fn delete_object(&self, region: &str, bucket: &str, key: &str) -> Result<()> {
        let request = HttpRequest::delete(self.client.s3_url(bucket, Some(region), key));
        self.client.send(request, "s3", region).await?;
        Ok(())
    }
}
