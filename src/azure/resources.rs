// file: src/azure/resources.rs
// version: 1.0.0
// guid: ae7c4a9b-6f3d-4c5b-98a4-a9b0c1d2e3f4

//! Azure resource hierarchy
//!
//! Subscription → ResourceGroup → {ComputeDisk, ComputeImage,
//! ComputeGallery → GalleryImage → GalleryImageVersion, StorageAccount}.
//! Each node holds its full path and a handle to the client; children are
//! built from their parent's path.

use super::client::AzureClient;
use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::network::http::Method;
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub const API_VERSION_RESOURCE_GROUP: &str = "2021-04-01";
pub const API_VERSION_DISK: &str = "2024-03-02";
pub const API_VERSION_IMAGE: &str = "2024-07-01";
pub const API_VERSION_GALLERY: &str = "2023-07-03";
pub const API_VERSION_STORAGE: &str = "2023-05-01";

/// Hyper-V generation of a disk or image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HyperVGeneration {
    V1,
    V2,
}

impl HyperVGeneration {
    pub fn as_str(&self) -> &'static str {
        match self {
            HyperVGeneration::V1 => "V1",
            HyperVGeneration::V2 => "V2",
        }
    }

    /// Generation an architecture boots with: arm64 is UEFI only
    pub fn for_arch(arch: Architecture) -> Self {
        match arch {
            Architecture::Amd64 => HyperVGeneration::V1,
            Architecture::Arm64 => HyperVGeneration::V2,
        }
    }
}

/// A node of the resource tree
#[derive(Clone)]
pub struct Resource {
    client: Arc<AzureClient>,
    path: String,
    api_version: &'static str,
    data: Option<Value>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.path)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl Resource {
    fn new(client: Arc<AzureClient>, path: String, api_version: &'static str) -> Self {
        Self {
            client,
            path,
            api_version,
            data: None,
        }
    }

    fn child(&self, segment: &str, name: &str, api_version: &'static str) -> Self {
        Self::new(
            self.client.clone(),
            format!("{}/{}/{}", self.path, segment, name),
            api_version,
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn api_version(&self) -> &'static str {
        self.api_version
    }

    pub fn client(&self) -> &Arc<AzureClient> {
        &self.client
    }

    /// Data of the last get or put
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    fn cache(&mut self, mut data: Value) -> &Value {
        if let Value::Object(obj) = &mut data {
            obj.remove("id");
            obj.remove("name");
        }
        self.data.insert(data)
    }

    pub async fn get(&mut self) -> Result<&Value> {
        let data = self.client.get_json(&self.path, self.api_version).await?;
        Ok(self.cache(data))
    }

    /// Create or update; with `wait`, block until provisioning settles
    pub async fn put(&mut self, body: &Value, wait: bool) -> Result<&Value> {
        let response = self
            .client
            .request(Method::Put, &self.path, self.api_version, Some(body))
            .await?;
        info!("Submitted {}", self.path);

        let data = if wait {
            self.client.wait_provisioned(&self.path, self.api_version).await?
        } else if response.body.is_empty() {
            Value::Null
        } else {
            response.json()?
        };
        Ok(self.cache(data))
    }

    pub async fn delete(&mut self) -> Result<()> {
        self.client
            .request(Method::Delete, &self.path, self.api_version, None)
            .await?;
        self.data = None;
        info!("Deleted {}", self.path);
        Ok(())
    }

    /// POST to an action below this resource, e.g. `beginGetAccess`
    pub async fn action(&self, action: &str, body: Option<&Value>) -> Result<crate::network::HttpResponse> {
        self.client
            .request(
                Method::Post,
                &format!("{}/{}", self.path, action),
                self.api_version,
                body,
            )
            .await
    }
}

pub struct Subscription {
    client: Arc<AzureClient>,
    path: String,
}

impl Subscription {
    pub fn new(client: Arc<AzureClient>, id: &str) -> Self {
        Self {
            client,
            path: format!("/subscriptions/{}", id),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn resource_group(&self, name: &str) -> ResourceGroup {
        ResourceGroup {
            resource: Resource::new(
                self.client.clone(),
                format!("{}/resourceGroups/{}", self.path, name),
                API_VERSION_RESOURCE_GROUP,
            ),
        }
    }
}

pub struct ResourceGroup {
    pub resource: Resource,
}

impl ResourceGroup {
    fn provider(&self, provider: &str) -> Resource {
        Resource::new(
            self.resource.client.clone(),
            format!("{}/providers/{}", self.resource.path, provider),
            self.resource.api_version,
        )
    }

    pub fn compute_disk(&self, name: &str) -> ComputeDisk {
        ComputeDisk {
            resource: self
                .provider("Microsoft.Compute")
                .child("disks", name, API_VERSION_DISK),
        }
    }

    pub fn compute_image(&self, name: &str) -> ComputeImage {
        ComputeImage {
            resource: self
                .provider("Microsoft.Compute")
                .child("images", name, API_VERSION_IMAGE),
        }
    }

    pub fn compute_gallery(&self, name: &str) -> ComputeGallery {
        ComputeGallery {
            resource: self
                .provider("Microsoft.Compute")
                .child("galleries", name, API_VERSION_GALLERY),
        }
    }

    pub fn storage_account(&self, name: &str) -> StorageAccount {
        StorageAccount {
            name: name.to_string(),
            resource: self
                .provider("Microsoft.Storage")
                .child("storageAccounts", name, API_VERSION_STORAGE),
        }
    }
}

/// Managed disk, created empty for upload
pub struct ComputeDisk {
    pub resource: Resource,
}

impl ComputeDisk {
    pub fn create_body(
        location: &str,
        size: u64,
        generation: HyperVGeneration,
        arch: Architecture,
    ) -> Value {
        json!({
            "location": location,
            "sku": {"name": "StandardSSD_LRS"},
            "properties": {
                "creationData": {
                    "createOption": "Upload",
                    "uploadSizeBytes": size,
                },
                "hyperVGeneration": generation.as_str(),
                "osType": "Linux",
                "supportedCapabilities": {
                    "acceleratedNetwork": true,
                    "architecture": arch.azure_name(),
                    "diskControllerTypes": "NVME, SCSI",
                },
            },
        })
    }

    /// Create the disk and wait until it is provisioned
    pub async fn create(
        &mut self,
        location: &str,
        size: u64,
        generation: HyperVGeneration,
        arch: Architecture,
    ) -> Result<&Value> {
        let body = Self::create_body(location, size, generation, arch);
        self.resource.put(&body, true).await
    }

    /// Current `properties.diskState`, always read from the API
    pub async fn disk_state(&mut self) -> Result<String> {
        let state = self
            .resource
            .get()
            .await?
            .pointer("/properties/diskState")
            .and_then(Value::as_str)
            .map(str::to_string);
        state.ok_or_else(|| {
            CloudImagesError::validation(format!("{} has no diskState", self.resource.path))
        })
    }
}

/// Managed image created from an uploaded disk
pub struct ComputeImage {
    pub resource: Resource,
}

impl ComputeImage {
    pub fn create_body(location: &str, generation: HyperVGeneration, disk: &ComputeDisk) -> Value {
        json!({
            "location": location,
            "properties": {
                "hyperVGeneration": generation.as_str(),
                "storageProfile": {
                    "osDisk": {
                        "osType": "Linux",
                        "osState": "Generalized",
                        "managedDisk": {"id": disk.resource.path()},
                    },
                },
            },
        })
    }

    pub async fn create(
        &mut self,
        location: &str,
        generation: HyperVGeneration,
        disk: &ComputeDisk,
    ) -> Result<&Value> {
        let body = Self::create_body(location, generation, disk);
        self.resource.put(&body, true).await
    }
}

pub struct ComputeGallery {
    pub resource: Resource,
}

impl ComputeGallery {
    pub fn image(&self, name: &str) -> GalleryImage {
        GalleryImage {
            resource: self.resource.child("images", name, API_VERSION_GALLERY),
        }
    }
}

/// Publisher/offer/sku triple of a gallery image definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentifier {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
}

pub struct GalleryImage {
    pub resource: Resource,
}

impl GalleryImage {
    pub fn create_body(
        location: &str,
        generation: HyperVGeneration,
        arch: Architecture,
        identifier: &ImageIdentifier,
    ) -> Value {
        json!({
            "location": location,
            "properties": {
                "osType": "Linux",
                "osState": "Generalized",
                "hyperVGeneration": generation.as_str(),
                "architecture": arch.azure_name(),
                "identifier": {
                    "publisher": identifier.publisher,
                    "offer": identifier.offer,
                    "sku": identifier.sku,
                },
            },
        })
    }

    pub async fn create(
        &mut self,
        location: &str,
        generation: HyperVGeneration,
        arch: Architecture,
        identifier: &ImageIdentifier,
    ) -> Result<&Value> {
        let body = Self::create_body(location, generation, arch, identifier);
        self.resource.put(&body, true).await
    }

    pub fn version(&self, name: &str) -> GalleryImageVersion {
        GalleryImageVersion {
            resource: self.resource.child("versions", name, API_VERSION_GALLERY),
        }
    }
}

pub struct GalleryImageVersion {
    pub resource: Resource,
}

impl GalleryImageVersion {
    pub fn create_body(location: &str, disk: &ComputeDisk) -> Value {
        json!({
            "location": location,
            "properties": {
                "storageProfile": {
                    "osDiskImage": {
                        "source": {"id": disk.resource.path()},
                    },
                },
            },
        })
    }

    /// Publish an uploaded disk as this version
    pub async fn create(&mut self, location: &str, disk: &ComputeDisk) -> Result<&Value> {
        let body = Self::create_body(location, disk);
        self.resource.put(&body, true).await
    }
}

pub struct StorageAccount {
    pub name: String,
    pub resource: Resource,
}

impl StorageAccount {
    /// Access keys of the account, in order
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let body: Value = self.resource.action("listKeys", None).await?.json()?;
        let keys = body
            .get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.get("value").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(CloudImagesError::not_found(format!(
                "No access keys for storage account {}",
                self.name
            )));
        }
        Ok(keys)
    }
}
