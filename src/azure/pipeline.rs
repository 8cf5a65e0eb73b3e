// file: src/azure/pipeline.rs
// version: 1.0.0
// guid: 5e9c3a7f-1b2d-4f08-96e4-a3b4c5d6e7f8

//! Azure upload stages
//!
//! The gallery stage turns every build into a Compute Gallery image
//! version through a temporary managed disk. The partner stage places the
//! VHD into a storage container and records a read-only SAS URL.

use super::disk::DiskUploader;
use super::resources::{
    GalleryImage, HyperVGeneration, ImageIdentifier, ResourceGroup, StorageAccount, Subscription,
};
use super::storage::{BlobService, ContainerSas};
use super::AzureClient;
use crate::api::{wellknown, Upload};
use crate::config::tool::{require, AzureConfig};
use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::image::version::{AzureImageVersion, ImageVersion};
use crate::image::ImageArchive;
use crate::manifest::bus::provider_labels;
use crate::manifest::{BuildManifest, ManifestBus, StageResult};
use crate::utils::qemu::{ImageConverter, ImageFormat};
use crate::utils::system::CommandRunner;
use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

pub const AZURE_PROVIDER: &str = "management.azure.com";
pub const STAGE_GALLERY: &str = "upload-azure";
pub const STAGE_PARTNER: &str = "upload-azure-partner";
pub const GALLERY_PUBLISHER: &str = "Debian";

/// SAS lifetime handed to partner offer consumers
const PARTNER_SAS_DAYS: i64 = 30;

/// Where gallery images go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryTarget {
    pub subscription: String,
    pub group: String,
    pub gallery: String,
    pub location: String,
}

impl GalleryTarget {
    pub fn from_config(config: &AzureConfig) -> Result<Self> {
        let image = &config.image;
        Ok(Self {
            subscription: require(image.subscription.as_deref(), "azure.image.subscription")?.to_string(),
            group: require(image.group.as_deref(), "azure.image.group")?.to_string(),
            gallery: require(image.gallery.as_deref(), "azure.image.gallery")?.to_string(),
            location: require(image.location.as_deref(), "azure.image.location")?.to_string(),
        })
    }
}

/// Gallery image definition per release and architecture
pub fn gallery_image_name(release_id: &str, arch: Architecture) -> String {
    match arch {
        Architecture::Amd64 => format!("debian-{}", release_id),
        Architecture::Arm64 => format!("debian-{}-arm64", release_id),
    }
}

fn build_arch(manifest: &BuildManifest) -> Result<Architecture> {
    manifest.build.arch()?.parse()
}

/// Compute Gallery upload through a temporary managed disk
pub struct GalleryPipeline {
    client: Arc<AzureClient>,
    converter: ImageConverter,
    uploader: DiskUploader,
    target: GalleryTarget,
}

impl GalleryPipeline {
    pub fn new(client: Arc<AzureClient>, runner: Arc<dyn CommandRunner>, target: GalleryTarget) -> Self {
        Self {
            client,
            converter: ImageConverter::new(runner),
            uploader: DiskUploader::new(),
            target,
        }
    }

    pub fn with_uploader(mut self, uploader: DiskUploader) -> Self {
        self.uploader = uploader;
        self
    }

    fn group(&self) -> ResourceGroup {
        Subscription::new(self.client.clone(), &self.target.subscription).resource_group(&self.target.group)
    }

    async fn ensure_gallery_image(
        &self,
        image: &mut GalleryImage,
        name: &str,
        generation: HyperVGeneration,
        arch: Architecture,
        release_id: &str,
    ) -> Result<()> {
        match image.resource.get().await {
            Ok(_) => Ok(()),
            Err(CloudImagesError::NotFound(_)) => {
                info!("Creating gallery image {}", name);
                let identifier = ImageIdentifier {
                    publisher: GALLERY_PUBLISHER.to_string(),
                    offer: format!("debian-{}", release_id),
                    sku: name.to_string(),
                };
                image
                    .create(&self.target.location, generation, arch, &identifier)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish one build as a gallery image version
    pub async fn upload(&self, manifest: &BuildManifest) -> Result<Upload> {
        let build = &manifest.build;
        let arch = build_arch(manifest)?;
        let release_id = build.release_id()?;
        let version = AzureImageVersion::from_image_version(&ImageVersion::from_string(build.version()?)?);
        let generation = HyperVGeneration::for_arch(arch);
        info!("Uploading {} to gallery {} as {}", manifest.name, self.target.gallery, version);

        let raw = ImageArchive::open(manifest.artifact_path()?)?.extract_disk_temp()?;
        let vhd = self.converter.open_converted(raw.path(), ImageFormat::Vhd).await?;

        let group = self.group();
        let mut disk = group.compute_disk(&manifest.name);
        disk.create(&self.target.location, vhd.len()?, generation, arch).await?;
        self.uploader.upload(&mut disk, vhd.path()).await?;

        let image_name = gallery_image_name(release_id, arch);
        let mut image = group.compute_gallery(&self.target.gallery).image(&image_name);
        self.ensure_gallery_image(&mut image, &image_name, generation, arch, release_id)
            .await?;

        let mut image_version = image.version(&version.to_string());
        image_version.create(&self.target.location, &disk).await?;
        info!("Created gallery image version {}", image_version.resource.path());

        // The version holds its own copy of the data
        if let Err(e) = disk.resource.delete().await {
            warn!("Failed to delete disk {}: {}", disk.resource.path(), e);
        }

        let build_type = build.info_opt("type").unwrap_or("dev");
        let [provider, upload_type] = provider_labels(AZURE_PROVIDER, build_type);
        Ok(manifest.derive_upload(
            AZURE_PROVIDER,
            image_version.resource.path(),
            Some(image.resource.path().to_string()),
            &[provider, upload_type, (wellknown::LABEL_AZURE_ARCH, arch.azure_name())],
        ))
    }

    /// Upload every build found on the bus
    pub async fn run(&self, bus: &ManifestBus) -> Result<Vec<Upload>> {
        bus.run_stage(STAGE_GALLERY, |manifest| async move {
            StageResult::from(self.upload(&manifest).await)
        })
        .await
    }
}

/// Storage account and container receiving partner offer VHDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerTarget {
    pub subscription: String,
    pub group: String,
    pub account: String,
}

impl PartnerTarget {
    pub fn from_config(config: &AzureConfig) -> Result<Self> {
        let storage = &config.storage;
        Ok(Self {
            subscription: require(storage.subscription.as_deref(), "azure.storage.subscription")?.to_string(),
            group: require(storage.group.as_deref(), "azure.storage.group")?.to_string(),
            account: require(storage.name.as_deref(), "azure.storage.name")?.to_string(),
        })
    }
}

/// Partner offer upload into a storage container
pub struct PartnerPipeline {
    client: Arc<AzureClient>,
    blobs: BlobService,
    converter: ImageConverter,
    target: PartnerTarget,
}

impl PartnerPipeline {
    pub fn new(
        client: Arc<AzureClient>,
        blobs: BlobService,
        runner: Arc<dyn CommandRunner>,
        target: PartnerTarget,
    ) -> Self {
        Self {
            client,
            blobs,
            converter: ImageConverter::new(runner),
            target,
        }
    }

    fn account(&self) -> StorageAccount {
        Subscription::new(self.client.clone(), &self.target.subscription)
            .resource_group(&self.target.group)
            .storage_account(&self.target.account)
    }

    /// Upload one build as `{name}.vhd` into container `debian-{release_id}`
    pub async fn upload(&self, manifest: &BuildManifest) -> Result<Upload> {
        let build = &manifest.build;
        let container = format!("debian-{}", build.release_id()?);
        let blob = format!("{}.vhd", manifest.name);

        let raw = ImageArchive::open(manifest.artifact_path()?)?.extract_disk_temp()?;
        let vhd = self.converter.open_converted(raw.path(), ImageFormat::Vhd).await?;

        self.blobs.create_container(&container).await?;
        self.blobs.upload_page_blob(&container, &blob, vhd.path()).await?;

        let keys = self.account().list_keys().await?;
        let now = Utc::now();
        let sas = ContainerSas {
            account: self.blobs.account().to_string(),
            container: container.clone(),
            permission: "rl".to_string(),
            start: now - ChronoDuration::days(1),
            expiry: now + ChronoDuration::days(PARTNER_SAS_DAYS),
        };
        let url = sas.blob_url(self.blobs.endpoint(), &blob, &keys[0])?;
        info!("Uploaded {} to {}/{}", manifest.name, container, blob);

        let provider = format!("{}.blob.core.windows.net", self.blobs.account());
        let build_type = build.info_opt("type").unwrap_or("dev");
        let arch = build_arch(manifest)?;
        let [provider_label, upload_type] = provider_labels(&provider, build_type);
        Ok(manifest.derive_upload(
            &provider,
            &url,
            None,
            &[provider_label, upload_type, (wellknown::LABEL_AZURE_ARCH, arch.azure_name())],
        ))
    }

    pub async fn run(&self, bus: &ManifestBus) -> Result<Vec<Upload>> {
        bus.run_stage(STAGE_PARTNER, |manifest| async move {
            StageResult::from(self.upload(&manifest).await)
        })
        .await
    }
}
