// file: src/image/mod.rs
// version: 2.0.0
// guid: a1b2c3d4-e5f6-7890-1234-567890abcdef

//! Image building and disk assembly
//!
//! This module handles:
//! - FAI builds inside a rootless sandbox
//! - Build artifact archives
//! - GPT disk assembly from OCI partition layers
//! - Image version numbers

pub mod archive;
pub mod assembler;
pub mod builder;
pub mod version;

pub use archive::{ExtractedDisk, ImageArchive};
pub use assembler::{DiskAssembler, GptLayout};
pub use builder::{BuildRequest, ImageBuilder, Sandbox};
pub use version::{AzureImageVersion, ImageVersion};
