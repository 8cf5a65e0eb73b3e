// file: src/gce/client.rs
// version: 1.0.0
// guid: 6d0f4b8c-3e5a-4c17-9f2d-7a8b9c0d1e2f

//! Cloud Storage and Compute Engine REST calls

use super::auth::GoogleAuth;
use crate::error::CloudImagesError;
use crate::network::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::Result;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const STORAGE_BASE: &str = "https://storage.googleapis.com";
pub const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

pub const GUEST_OS_FEATURES: &[&str] = &["UEFI_COMPATIBLE", "VIRTIO_SCSI_MULTIQUEUE"];

/// Image to create from a disk archive in Cloud Storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub family: String,
    pub description: String,
    pub source_uri: String,
    /// `X86_64` or `ARM64`
    pub architecture: String,
}

impl ImageSpec {
    pub fn body(&self) -> Value {
        let features: Vec<Value> = GUEST_OS_FEATURES.iter().map(|f| json!({ "type": f })).collect();
        json!({
            "name": self.name,
            "family": self.family,
            "description": self.description,
            "architecture": self.architecture,
            "rawDisk": { "source": self.source_uri },
            "guestOsFeatures": features,
        })
    }
}

pub struct GceClient {
    auth: Arc<GoogleAuth>,
    http: Arc<dyn HttpTransport>,
    storage_base: String,
    compute_base: String,
    poll_interval: Duration,
}

impl GceClient {
    pub fn new(auth: Arc<GoogleAuth>, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            auth,
            http,
            storage_base: STORAGE_BASE.to_string(),
            compute_base: COMPUTE_BASE.to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_bases(mut self, storage: impl Into<String>, compute: impl Into<String>) -> Self {
        self.storage_base = storage.into();
        self.compute_base = compute.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn send(&self, request: HttpRequest, context: &str) -> Result<HttpResponse> {
        let token = self.auth.token().await?;
        self.http.send(request.bearer(&token)).await?.error_for_status(context)
    }

    /// Public URL of an object, used as image source
    pub fn object_url(&self, bucket: &str, name: &str) -> String {
        format!("{}/{}/{}", self.storage_base, bucket, name)
    }

    /// Simple media upload of a file
    pub async fn upload_object(&self, bucket: &str, name: &str, path: &Path) -> Result<()> {
        let size = std::fs::metadata(path)?.len();
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.storage_base,
            bucket,
            url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
        );
        info!("Uploading {} to gs://{}/{} ({} bytes)", path.display(), bucket, name, size);
        let request = HttpRequest::post(url)
            .header("Content-Type", "application/octet-stream")
            .file(path, 0, size);
        self.send(request, &format!("Upload gs://{}/{}", bucket, name)).await?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.storage_base,
            bucket,
            url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
        );
        self.send(HttpRequest::delete(url), &format!("Delete gs://{}/{}", bucket, name))
            .await?;
        Ok(())
    }

    fn images_url(&self, project: &str) -> String {
        format!("{}/projects/{}/global/images", self.compute_base, project)
    }

    pub async fn image_exists(&self, project: &str, name: &str) -> Result<bool> {
        let url = format!("{}/{}", self.images_url(project), name);
        match self.send(HttpRequest::get(url), &format!("Get image {}", name)).await {
            Ok(_) => Ok(true),
            Err(CloudImagesError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Insert an image and wait for the operation to finish
    pub async fn create_image(&self, project: &str, image: &ImageSpec) -> Result<Value> {
        let request = HttpRequest::post(self.images_url(project)).json(&image.body())?;
        let operation: Value = self
            .send(request, &format!("Insert image {}", image.name))
            .await?
            .json()?;
        let name = operation
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudImagesError::RemoteError {
                status: 200,
                message: "Image insert returned no operation".to_string(),
            })?;
        info!("Creating image {} in {} ({})", image.name, project, name);
        self.wait_operation(project, name).await
    }

    /// Poll a global operation until it is `DONE`
    pub async fn wait_operation(&self, project: &str, operation: &str) -> Result<Value> {
        let url = format!("{}/projects/{}/global/operations/{}", self.compute_base, project, operation);
        loop {
            let state: Value = self
                .send(HttpRequest::get(url.as_str()), &format!("Operation {}", operation))
                .await?
                .json()?;
            let status = state.get("status").and_then(Value::as_str).unwrap_or_default();
            if status == "DONE" {
                if let Some(errors) = state.pointer("/error/errors").and_then(Value::as_array) {
                    let messages: Vec<&str> = errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect();
                    return Err(CloudImagesError::provisioning(format!(
                        "Operation {} failed: {}",
                        operation,
                        messages.join("; ")
                    )));
                }
                return Ok(state);
            }
            debug!("Operation {} is {}", operation, status);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
