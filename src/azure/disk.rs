// file: src/azure/disk.rs
// version: 1.0.0
// guid: bf8d5b0c-7a4e-4d6c-a9b5-b0c1d2e3f4a5

//! Upload of raw images into managed disks
//!
//! The disk grants write access through a short lived SAS URL. Data runs of
//! the image are written as 4 MiB page ranges; holes are left untouched.

use super::resources::ComputeDisk;
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpTransport};
use crate::utils::progress::byte_progress;
use crate::utils::retry::{retry_transient, RetryPolicy};
use crate::utils::sparse::{SparseChunks, CHUNK_SIZE};
use crate::Result;
use serde_json::{json, Value};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BEGIN_ACCESS_POLLS: u32 = 10;
const END_ACCESS_POLLS: u32 = 30;
const UPLOADABLE_STATES: [&str; 2] = ["ReadyToUpload", "ActiveUpload"];

/// Streams a raw image into a disk created for upload
pub struct DiskUploader {
    page_retry: RetryPolicy,
    progress: bool,
}

impl Default for DiskUploader {
    fn default() -> Self {
        Self {
            page_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            progress: false,
        }
    }
}

impl DiskUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_page_retry(mut self, policy: RetryPolicy) -> Self {
        self.page_retry = policy;
        self
    }

    /// Upload `image` into `disk`, returning the number of data bytes sent
    pub async fn upload(&self, disk: &mut ComputeDisk, image: &Path) -> Result<u64> {
        let state = disk.disk_state().await?;
        if !UPLOADABLE_STATES.contains(&state.as_str()) {
            return Err(CloudImagesError::precondition(format!(
                "Disk {} is in state {}, expected one of {:?}",
                disk.resource.path(),
                state,
                UPLOADABLE_STATES
            )));
        }

        let sas = self.begin_access(disk).await?;
        let http = disk.resource.client().http().clone();
        let result = self.write_pages(http, &sas, image).await;

        // Access is revoked even when the upload failed
        let revoked = self.end_access(disk).await;
        match (result, revoked) {
            (Ok(written), Ok(())) => Ok(written),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(end_err)) => {
                warn!("Revoking disk access failed as well: {}", end_err);
                Err(e)
            }
        }
    }

    async fn begin_access(&self, disk: &ComputeDisk) -> Result<String> {
        let body = json!({
            "access": "Write",
            "durationInSeconds": 3600,
            "fileFormat": "VHD",
        });
        let response = disk.resource.action("beginGetAccess", Some(&body)).await?;
        let monitor = response
            .header("Location")
            .ok_or_else(|| CloudImagesError::validation("beginGetAccess returned no Location"))?
            .to_string();

        let result: Value = disk
            .resource
            .client()
            .poll_monitor(&monitor, disk.resource.path(), BEGIN_ACCESS_POLLS)
            .await?
            .json()?;
        let sas = result
            .get("accessSAS")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudImagesError::validation("Access grant lacks accessSAS"))?;
        info!("Write access granted to {}", disk.resource.path());
        Ok(sas.to_string())
    }

    async fn end_access(&self, disk: &ComputeDisk) -> Result<()> {
        let response = disk.resource.action("endGetAccess", None).await?;
        if let Some(monitor) = response.header("Location") {
            disk.resource
                .client()
                .poll_monitor(monitor, disk.resource.path(), END_ACCESS_POLLS)
                .await?;
        }
        info!("Write access revoked from {}", disk.resource.path());
        Ok(())
    }

    async fn write_pages(&self, http: Arc<dyn HttpTransport>, sas: &str, image: &Path) -> Result<u64> {
        let url = page_url(sas);
        let file = File::open(image)?;
        let chunks = SparseChunks::new(&file, CHUNK_SIZE)?;
        let progress = byte_progress(chunks.file_size(), self.progress);
        let mut written = 0u64;

        // Chunks are collected first since the walker borrows the file
        // synchronously
        let data: Vec<_> = chunks.data().collect::<Result<_>>()?;
        for chunk in data {
            retry_transient(self.page_retry, "Page upload", || {
                let request = HttpRequest::put(url.clone())
                    .header("Content-Length", chunk.size.to_string())
                    .header("Range", format!("bytes={}-{}", chunk.offset, chunk.end_inclusive()))
                    .header("x-ms-page-write", "update")
                    .file(image, chunk.offset, chunk.size);
                let http = http.clone();
                async move {
                    http.send(request)
                        .await?
                        .expect_status(201, "Page upload")
                        .map(|_| ())
                }
            })
            .await?;
            written += chunk.size;
            progress.set_position(chunk.offset + chunk.size);
            debug!("Wrote pages {}..{}", chunk.offset, chunk.end_inclusive());
        }

        progress.finish_and_clear();
        info!("Uploaded {} data bytes from {}", written, image.display());
        Ok(written)
    }
}

/// Page write URL for a SAS URL that already carries a query
fn page_url(sas: &str) -> String {
    if sas.contains('?') {
        format!("{}&comp=page", sas)
    } else {
        format!("{}?comp=page", sas)
    }
}
