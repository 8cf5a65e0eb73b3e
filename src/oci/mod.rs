// file: src/oci/mod.rs
// version: 1.0.0
// guid: 4b8d2f6a-9e13-4c75-a0b1-c2d3e4f5a6b7

//! OCI image layout used to stage intermediate artifacts

pub mod layout;
pub mod store;

pub use layout::{BlobInfo, Descriptor, ImageIndex, ImageManifest, PartitionKind};
pub use store::OciStore;
