// file: src/azure/mod.rs
// version: 1.0.0
// guid: d1af7d2e-9c6a-4f8e-81d7-d2e3f4a5b6c7

//! Azure Resource Manager client, managed disk uploads and storage blobs

pub mod auth;
pub mod client;
pub mod disk;
pub mod pipeline;
pub mod resources;
pub mod storage;

pub use auth::{AzureAuth, Credentials};
pub use client::{AzureClient, PollConfig};
pub use disk::DiskUploader;
pub use resources::{
    ComputeDisk, ComputeGallery, ComputeImage, GalleryImage, GalleryImageVersion, HyperVGeneration,
    ResourceGroup, StorageAccount, Subscription,
};
pub use storage::{BlobService, ContainerSas};
pub use pipeline::{GalleryPipeline, GalleryTarget, PartnerPipeline, PartnerTarget};
