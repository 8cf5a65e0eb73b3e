// file: src/lib.rs
// version: 3.0.0
// guid: d82472d1-7f0f-4eb4-b0a3-6e1547103eb4

//! # Debian Cloud Images
//!
//! Builds Debian cloud images, assembles raw disks from staged OCI
//! artifacts and publishes the results to Azure, EC2, GCE and a public
//! storage tree. Every stage records what it produced in typed manifests
//! that carry the build metadata forward.

pub mod api;
pub mod aws;
pub mod azure;
pub mod cli;
pub mod config;
pub mod error;
pub mod gce;
pub mod image;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod oci;
pub mod publish;
pub mod utils;

pub use error::{CloudImagesError, Result};

/// Version information for the tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
