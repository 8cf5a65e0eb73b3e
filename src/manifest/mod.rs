// file: src/manifest/mod.rs
// version: 1.0.0
// guid: 1a9f4c7e-6d2b-4e53-8b10-c4d5e6f7a8b9

//! Reading and writing stage manifests

pub mod bus;

pub use bus::{derive_metadata, read_build, write_merged, BuildManifest, Discovery, ManifestBus, StageResult};
